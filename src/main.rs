pub mod app;
pub mod config;
pub mod control;
pub mod display;
pub mod mqtt;
pub mod schedule;
pub mod telemetry;

use crate::app::App;
use crate::config::{Settings, SettingsSource};
use crate::control::ButtonEvent;
use crate::display::DisplaySnapshot;
use crate::schedule::power::SimulatedPower;
use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = setup().await?;
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received"),
            Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
        }
        token.cancel();
    });

    let (button_tx, button_rx) = mpsc::channel(16);
    tokio::spawn(read_buttons(button_tx, shutdown.clone()));

    let (snapshot_tx, snapshot_rx) = watch::channel(DisplaySnapshot::starting());
    let display_handle = tokio::spawn(display::log_snapshots(snapshot_rx, shutdown.clone()));

    let app = App::new(
        settings,
        SimulatedPower,
        button_rx,
        snapshot_tx,
        shutdown.clone(),
    )
    .map_err(|e| eyre!("Invalid schedule configuration: {}", e))?;
    app.run().await;

    shutdown.cancel();
    if let Err(e) = display_handle.await {
        warn!("Display task ended abnormally: {}", e);
    }
    Ok(())
}

async fn setup() -> Result<Settings> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let (settings, source) = Settings::load().await?;
    setup_logging_env(settings.logging.max_level());
    match source {
        SettingsSource::File(path) => info!("Loaded settings from {}", path.display()),
        SettingsSource::Defaults(path) => {
            warn!("No settings at {}, using defaults", path.display())
        }
    }
    Ok(settings)
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Host stand-in for the hardware buttons: `w` wakes, `c` toggles the
/// charger, `i` toggles the inverter.
async fn read_buttons(buttons: mpsc::Sender<ButtonEvent>, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };
        let event = match line {
            Ok(Some(line)) => match line.trim() {
                "w" => ButtonEvent::Wake,
                "c" => ButtonEvent::ToggleCharger,
                "i" => ButtonEvent::ToggleInverter,
                "" => continue,
                other => {
                    warn!("Unknown button {:?} (use w, c or i)", other);
                    continue;
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };
        debug!("Button {:?}", event);
        if buttons.send(event).await.is_err() {
            return;
        }
    }
    // Without stdin the device simply has no buttons.
    shutdown.cancelled().await;
}
