//! Turns telemetry into what the screen shows.
//!
//! The [`Presenter`] builds a [`DisplaySnapshot`] once per display tick;
//! the app publishes it on a `watch` channel and the renderer (here a
//! console logger) picks up changes.

use crate::config::DisplayConfig;
use crate::control::VebusMode;
use crate::schedule::PowerState;
use crate::telemetry::format::{format_decimal, NumberPolicy, PowerFormat};
use crate::telemetry::store::{Reading, TelemetryStore};
use crate::telemetry::{Channel, ChannelKey, ChannelKind, Unit};
use std::fmt;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const MISSING: &str = "--";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusBanner {
    AwaitingConnection,
    DataUpdatesStopped,
}

impl fmt::Display for StatusBanner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusBanner::AwaitingConnection => write!(f, "Awaiting connection"),
            StatusBanner::DataUpdatesStopped => write!(f, "Data updates have stopped"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatteryLevel {
    Green,
    Yellow,
    Red,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelReading {
    pub key: ChannelKey,
    pub label: &'static str,
    pub text: String,
    pub stale: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DisplaySnapshot {
    pub power_state: PowerState,
    pub banner: Option<StatusBanner>,
    pub readings: Vec<ChannelReading>,
    pub battery_level: Option<BatteryLevel>,
    pub charger_on: Option<bool>,
    pub inverter_on: Option<bool>,
}

impl DisplaySnapshot {
    /// What the screen shows before the first tick.
    pub fn starting() -> Self {
        Self {
            power_state: PowerState::Active,
            banner: Some(StatusBanner::AwaitingConnection),
            readings: Vec::new(),
            battery_level: None,
            charger_on: None,
            inverter_on: None,
        }
    }

    pub fn reading(&self, key: ChannelKey) -> Option<&ChannelReading> {
        self.readings.iter().find(|reading| reading.key == key)
    }
}

impl fmt::Display for DisplaySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.power_state != PowerState::Active {
            return write!(f, "[display {}]", self.power_state);
        }
        if let Some(banner) = self.banner {
            write!(f, "[{}] ", banner)?;
        }
        let mut first = true;
        for reading in &self.readings {
            if !first {
                write!(f, " | ")?;
            }
            first = false;
            write!(f, "{}: {}", reading.label, reading.text)?;
            if reading.stale {
                write!(f, " (stale)")?;
            }
        }
        if let Some(on) = self.charger_on {
            write!(f, " | Charger {}", if on { "on" } else { "off" })?;
        }
        if let Some(on) = self.inverter_on {
            write!(f, " | Inverter {}", if on { "on" } else { "off" })?;
        }
        Ok(())
    }
}

/// Victron `SystemState/State` names.
pub fn charge_state_name(code: i64) -> String {
    let name = match code {
        0 => "Off",
        1 => "Low power",
        2 => "Fault",
        3 => "Bulk",
        4 => "Absorption",
        5 => "Float",
        6 => "Storage",
        7 => "Equalize",
        8 => "Passthru",
        9 => "Inverting",
        10 => "Power assist",
        11 => "Power supply",
        244 => "Sustain",
        252 => "ESS",
        other => return format!("State {}", other),
    };
    name.to_string()
}

/// Seconds as `H:MM`.
pub fn format_time_to_go(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return MISSING.to_string();
    }
    let minutes = (seconds / 60.0).floor() as u64;
    format!("{}:{:02}", minutes / 60, minutes % 60)
}

/// AwaitingConnection wins over DataUpdatesStopped.
pub fn banner(connected: bool, data_stopped: bool) -> Option<StatusBanner> {
    if !connected {
        Some(StatusBanner::AwaitingConnection)
    } else if data_stopped {
        Some(StatusBanner::DataUpdatesStopped)
    } else {
        None
    }
}

#[derive(Clone, Debug)]
pub struct Presenter {
    power: PowerFormat,
    policy: NumberPolicy,
    yellow_at: f64,
    red_at: f64,
    show_charger: bool,
    show_inverter: bool,
}

impl Presenter {
    pub fn from_config(display: &DisplayConfig) -> Self {
        let power = PowerFormat::from_config(display);
        Self {
            policy: power.policy,
            power,
            yellow_at: display.battery_yellow_at,
            red_at: display.battery_red_at,
            show_charger: display.show_charger_mode,
            show_inverter: display.show_inverter_mode,
        }
    }

    pub fn battery_level(&self, soc: f64) -> BatteryLevel {
        if soc <= self.red_at {
            BatteryLevel::Red
        } else if soc <= self.yellow_at {
            BatteryLevel::Yellow
        } else {
            BatteryLevel::Green
        }
    }

    pub fn snapshot(
        &self,
        store: &TelemetryStore,
        power_state: PowerState,
        connected: bool,
        data_stopped: bool,
        now: Instant,
    ) -> DisplaySnapshot {
        let readings = store
            .channels()
            .filter(|channel| channel.enabled && shown_as_reading(channel.key))
            .map(|channel| ChannelReading {
                key: channel.key,
                label: channel.key.label(),
                text: store
                    .reading(channel.key)
                    .map(|reading| self.format_reading(channel, reading))
                    .unwrap_or_else(|| MISSING.to_string()),
                stale: store.is_stale(channel.key, now),
            })
            .collect();

        let battery_level = store
            .reading(ChannelKey::BatterySoc)
            .and_then(Reading::as_number)
            .map(|soc| self.battery_level(soc));

        let mode = store
            .reading(ChannelKey::VebusMode)
            .and_then(Reading::as_state)
            .and_then(VebusMode::from_code);

        DisplaySnapshot {
            power_state,
            banner: banner(connected, data_stopped),
            readings,
            battery_level,
            charger_on: mode
                .filter(|_| self.show_charger)
                .map(|mode| mode.charger_on()),
            inverter_on: mode
                .filter(|_| self.show_inverter)
                .map(|mode| mode.inverter_on()),
        }
    }

    fn format_reading(&self, channel: &Channel, reading: &Reading) -> String {
        match (reading, channel.kind) {
            (Reading::Unavailable, _) => MISSING.to_string(),
            (Reading::Text(text), _) => text.clone(),
            (Reading::State(code), ChannelKind::Enumerated)
                if channel.key == ChannelKey::ChargeState =>
            {
                charge_state_name(*code)
            }
            (Reading::State(code), _) => code.to_string(),
            (Reading::Number(value), _) => match channel.unit {
                Unit::Watt => self.power.format(*value),
                Unit::Percent => format!("{}%", format_decimal(*value, 0, self.policy)),
                Unit::Seconds => format_time_to_go(*value),
                Unit::Celsius => format!(
                    "{} {}",
                    format_decimal(*value, 1, self.policy),
                    channel.unit.suffix()
                ),
                Unit::None => format_decimal(*value, 1, self.policy),
            },
        }
    }
}

/// Serial and mode are not shown as plain lines.
fn shown_as_reading(key: ChannelKey) -> bool {
    !matches!(key, ChannelKey::SystemSerial | ChannelKey::VebusMode)
}

/// Console renderer: logs every snapshot change until shutdown.
pub async fn log_snapshots(
    mut snapshots: watch::Receiver<DisplaySnapshot>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    debug!("Snapshot sender dropped");
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                info!("{}", snapshot);
            }
        }
    }
}
