//! Power controller seam.
//!
//! On the device deep sleep powers everything down except the RTC timer
//! and the wake button. The host backend emulates that by parking until
//! the timer expires, a button arrives or shutdown is requested.

use crate::control::ButtonEvent;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeCause {
    Timer,
    Button,
    Shutdown,
}

pub trait PowerBackend {
    /// Enters deep sleep. `timer` is `None` when only the button may wake us.
    fn deep_sleep(
        &mut self,
        timer: Option<Duration>,
        buttons: &mut mpsc::Receiver<ButtonEvent>,
        shutdown: &CancellationToken,
    ) -> impl Future<Output = WakeCause> + Send;
}

/// Host stand-in for the ESP32 sleep controller.
#[derive(Debug, Default)]
pub struct SimulatedPower;

impl PowerBackend for SimulatedPower {
    async fn deep_sleep(
        &mut self,
        timer: Option<Duration>,
        buttons: &mut mpsc::Receiver<ButtonEvent>,
        shutdown: &CancellationToken,
    ) -> WakeCause {
        match timer {
            Some(timer) => info!("Entering deep sleep for {:?}", timer),
            None => info!("Entering deep sleep until a button is pressed"),
        }

        let timer_expired = async {
            match timer {
                Some(timer) => tokio::time::sleep(timer).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => WakeCause::Shutdown,
            _ = timer_expired => WakeCause::Timer,
            button = buttons.recv() => match button {
                Some(_) => WakeCause::Button,
                None => WakeCause::Shutdown,
            },
        }
    }
}
