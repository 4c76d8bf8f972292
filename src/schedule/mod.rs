//! Display sleep/wake scheduling
//!
//! # State Machine
//!
//! ```text
//!            in window / boot grace / button
//!   Asleep ─────────────────────────────────► Active
//!   DeepAsleep ◄───────────────────────────── Active
//!            outside window and no dwell left
//! ```
//!
//! Which sleeping state is used depends on `use_deep_sleep`. A wake time
//! equal to the sleep time means "default off": the display is only on
//! during the boot grace window and after a button press.
//!
//! Light sleep keeps the wall clock exact. Deep sleep relies on a
//! drifting timer, so wake deadlines go through [`drift::DriftCompensator`]
//! and an early wake simply sleeps again for the remainder.

pub mod drift;
pub mod power;

use crate::config::ScheduleConfig;
use chrono::{NaiveTime, Timelike};
use drift::DriftCompensator;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

const SECONDS_PER_DAY: u32 = 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid {field} {value:?}: expected HH:MM between 00:00 and 23:59")]
    InvalidTime { field: &'static str, value: String },

    #[error("invalid {field} {value}: {expected}")]
    InvalidDrift {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    Active,
    /// Display off, device responsive, clock exact.
    Asleep,
    /// Everything off except timer and wake button.
    DeepAsleep,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PowerState::Active => write!(f, "active"),
            PowerState::Asleep => write!(f, "asleep"),
            PowerState::DeepAsleep => write!(f, "deep asleep"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SleepWindow {
    pub wake: NaiveTime,
    pub sleep: NaiveTime,
}

impl SleepWindow {
    pub fn parse(wake: &str, sleep: &str) -> Result<Self, ScheduleError> {
        Ok(Self {
            wake: parse_time("wake_time", wake)?,
            sleep: parse_time("sleep_time", sleep)?,
        })
    }

    /// Wake equal to sleep: display defaults to off.
    pub fn default_off(&self) -> bool {
        self.wake == self.sleep
    }

    /// `[wake, sleep)`, wrapping across midnight when wake > sleep.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.wake < self.sleep {
            self.wake <= time && time < self.sleep
        } else if self.wake > self.sleep {
            time >= self.wake || time < self.sleep
        } else {
            false
        }
    }

    /// Wall time from `now` until the next wake time-of-day.
    pub fn until_wake(&self, now: NaiveTime) -> Duration {
        let now_secs = now.num_seconds_from_midnight();
        let wake_secs = self.wake.num_seconds_from_midnight();
        let mut secs = (wake_secs + SECONDS_PER_DAY - now_secs) % SECONDS_PER_DAY;
        if secs == 0 {
            secs = SECONDS_PER_DAY;
        }
        Duration::from_secs(u64::from(secs)).saturating_sub(Duration::from_nanos(u64::from(
            now.nanosecond() % 1_000_000_000,
        )))
    }
}

fn parse_time(field: &'static str, value: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ScheduleError::InvalidTime {
        field,
        value: value.to_string(),
    })
}

/// A drift correction of -1e6 ppm or below would request a zero or
/// negative timer.
fn check_drift(config: &ScheduleConfig) -> Result<(), ScheduleError> {
    let invalid = |field, value: f64, expected| ScheduleError::InvalidDrift {
        field,
        value: value.to_string(),
        expected,
    };
    let max = config.max_drift_ppm;
    if !max.is_finite() || max < 0.0 || max >= drift::PPM {
        return Err(invalid(
            "max_drift_ppm",
            max,
            "expected a finite value from 0 up to (not including) 1000000",
        ));
    }
    if !config.initial_drift_ppm.is_finite() {
        return Err(invalid(
            "initial_drift_ppm",
            config.initial_drift_ppm,
            "expected a finite value",
        ));
    }
    if !(0.0..=1.0).contains(&config.drift_smoothing) {
        return Err(invalid(
            "drift_smoothing",
            config.drift_smoothing,
            "expected a value from 0 to 1",
        ));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    AlwaysOn,
    Window(SleepWindow),
}

/// What to hand the power controller when entering deep sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeepSleepPlan {
    /// Real time until the wake deadline.
    pub wall: Option<Duration>,
    /// Drift-corrected timer request.
    pub timer: Option<Duration>,
}

#[derive(Debug)]
pub struct SleepScheduler {
    schedule: Schedule,
    use_deep_sleep: bool,
    boot: Instant,
    boot_grace: Duration,
    manual_dwell: Duration,
    manual_until: Option<Instant>,
    state: PowerState,
    drift: DriftCompensator,
}

impl SleepScheduler {
    pub fn from_config(config: &ScheduleConfig, boot: Instant) -> Result<Self, ScheduleError> {
        let schedule = if config.display_at_specific_times_only {
            Schedule::Window(SleepWindow::parse(&config.wake_time, &config.sleep_time)?)
        } else {
            Schedule::AlwaysOn
        };
        check_drift(config)?;
        let drift = DriftCompensator::new(
            config.initial_drift_ppm,
            config.max_drift_ppm,
            config.drift_smoothing,
        );
        Ok(Self {
            schedule,
            use_deep_sleep: config.use_deep_sleep,
            boot,
            boot_grace: Duration::from_secs(config.boot_grace_secs),
            manual_dwell: Duration::from_secs(config.manual_wake_secs),
            manual_until: None,
            state: PowerState::Active,
            drift,
        })
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Re-evaluates the schedule against the current time.
    pub fn evaluate(&mut self, now: Instant, time_of_day: NaiveTime) -> PowerState {
        let active = match self.schedule {
            Schedule::AlwaysOn => true,
            Schedule::Window(window) => {
                let scheduled = if window.default_off() {
                    now.saturating_duration_since(self.boot) < self.boot_grace
                } else {
                    window.contains(time_of_day)
                };
                scheduled || self.manual_until.is_some_and(|until| now < until)
            }
        };

        let next = if active {
            PowerState::Active
        } else if self.use_deep_sleep {
            PowerState::DeepAsleep
        } else {
            PowerState::Asleep
        };
        if next != self.state {
            info!("Display {} -> {} at {}", self.state, next, time_of_day.format("%H:%M:%S"));
            self.state = next;
        }
        next
    }

    /// Button press: stay active for the dwell time, then follow the schedule.
    pub fn manual_wake(&mut self, now: Instant) {
        debug!("Manual wake for {:?}", self.manual_dwell);
        self.manual_until = Some(now + self.manual_dwell);
        if self.state != PowerState::Active {
            info!("Display {} -> {} (button)", self.state, PowerState::Active);
            self.state = PowerState::Active;
        }
    }

    pub fn deep_sleep_plan(&self, time_of_day: NaiveTime) -> DeepSleepPlan {
        match self.schedule {
            Schedule::Window(window) if !window.default_off() => {
                let wall = window.until_wake(time_of_day);
                DeepSleepPlan {
                    wall: Some(wall),
                    timer: Some(self.drift.timer_for(wall)),
                }
            }
            _ => DeepSleepPlan {
                wall: None,
                timer: None,
            },
        }
    }

    /// Records a completed timer-woken deep sleep cycle.
    pub fn record_deep_sleep(&mut self, timer: Duration, actual: Duration) {
        self.drift.record(timer, actual);
    }

    pub fn drift(&self) -> &DriftCompensator {
        &self.drift
    }

    /// Deep sleep loses everything but the RTC; start over as after boot.
    pub fn rebooted(&mut self, now: Instant) {
        self.boot = now;
        self.manual_until = None;
        self.state = PowerState::Active;
    }
}
