//! Deep-sleep timer drift compensation.
//!
//! The deep-sleep timer runs on an imprecise RC clock: a 23h50m request
//! has been seen to wake about 15 minutes early. Drift is expressed in
//! ppm of timer speed (positive means the timer runs fast and wakes
//! early) and learned from completed sleep cycles, since it varies per
//! device and with temperature.

use std::time::Duration;
use tracing::{debug, info};

pub const PPM: f64 = 1_000_000.0;

#[derive(Clone, Debug, PartialEq)]
pub struct DriftCompensator {
    ppm: f64,
    max_ppm: f64,
    smoothing: f64,
    samples: u32,
}

impl DriftCompensator {
    pub fn new(initial_ppm: f64, max_ppm: f64, smoothing: f64) -> Self {
        let max_ppm = max_ppm.abs();
        Self {
            ppm: initial_ppm.clamp(-max_ppm, max_ppm),
            max_ppm,
            smoothing: smoothing.clamp(0.0, 1.0),
            samples: 0,
        }
    }

    pub fn ppm(&self) -> f64 {
        self.ppm
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Timer duration to request so that `wall` of real time passes.
    /// Falls back to `wall` when the correction is not representable.
    pub fn timer_for(&self, wall: Duration) -> Duration {
        Duration::try_from_secs_f64(wall.as_secs_f64() * (1.0 + self.ppm / PPM)).unwrap_or(wall)
    }

    /// Folds in one completed cycle: `requested` timer duration against the
    /// `actual` wall time that passed.
    pub fn record(&mut self, requested: Duration, actual: Duration) {
        if requested.is_zero() || actual.is_zero() {
            return;
        }
        let sample = (requested.as_secs_f64() / actual.as_secs_f64() - 1.0) * PPM;
        let updated = self.ppm + self.smoothing * (sample - self.ppm);
        self.ppm = updated.clamp(-self.max_ppm, self.max_ppm);
        self.samples += 1;

        debug!(
            "Deep sleep: requested {:?}, slept {:?}, sample {:.0} ppm",
            requested, actual, sample
        );
        info!(
            "Deep sleep drift estimate now {:.0} ppm after {} samples",
            self.ppm, self.samples
        );
    }
}
