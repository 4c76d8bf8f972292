//! Latest value per channel, with freshness tracking.
//!
//! Written only from the bus dispatch path, read by the presenter.

use super::{Channel, ChannelKey, ChannelKind};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A decoded payload value.
#[derive(Clone, Debug, PartialEq)]
pub enum Reading {
    Number(f64),
    State(i64),
    Text(String),
    /// Venus published `null` (or cleared the topic): the value is not
    /// available right now.
    Unavailable,
}

impl Reading {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Reading::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<i64> {
        match self {
            Reading::State(code) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("channel {0} is disabled")]
    Disabled(ChannelKey),

    #[error("channel {0} is not tracked by this store")]
    Untracked(ChannelKey),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no `value` field")]
    MissingValue,

    #[error("{key} expects {expected}, got {found}")]
    TypeMismatch {
        key: ChannelKey,
        expected: &'static str,
        found: String,
    },
}

pub type DecodeResult = Result<Reading, DecodeError>;

#[derive(Clone, Debug)]
struct Entry {
    channel: Channel,
    reading: Option<Reading>,
    updated_at: Option<Instant>,
    stale: bool,
}

#[derive(Debug)]
pub struct TelemetryStore {
    entries: BTreeMap<ChannelKey, Entry>,
    staleness_window: Duration,
    last_update: Option<Instant>,
    decode_failures: u64,
}

impl TelemetryStore {
    pub fn new(channels: &[Channel], staleness_window: Duration) -> Self {
        let entries = channels
            .iter()
            .map(|channel| {
                (
                    channel.key,
                    Entry {
                        channel: channel.clone(),
                        reading: None,
                        updated_at: None,
                        stale: false,
                    },
                )
            })
            .collect();

        Self {
            entries,
            staleness_window,
            last_update: None,
            decode_failures: 0,
        }
    }

    /// Decodes `payload` for `key` and stores it.
    ///
    /// A failed decode leaves the previous value in place and only bumps
    /// the failure counter.
    pub fn update(&mut self, key: ChannelKey, payload: &[u8], now: Instant) -> DecodeResult {
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(DecodeError::Untracked(key))?;
        if !entry.channel.enabled {
            return Err(DecodeError::Disabled(key));
        }

        let reading = match decode(&entry.channel, payload) {
            Ok(reading) => reading,
            Err(e) => {
                self.decode_failures += 1;
                warn!(
                    "Dropping update for {} ({} failures so far): {}",
                    key, self.decode_failures, e
                );
                return Err(e);
            }
        };

        if entry.stale {
            info!("{} is fresh again", key);
        }
        debug!("{} = {:?}", key, reading);
        entry.reading = Some(reading.clone());
        entry.updated_at = Some(now);
        entry.stale = false;
        self.last_update = Some(now);
        Ok(reading)
    }

    /// True once the last update is older than the staleness window.
    /// Channels that never received anything are unknown, not stale.
    pub fn is_stale(&self, key: ChannelKey, now: Instant) -> bool {
        self.entries
            .get(&key)
            .and_then(|entry| entry.updated_at)
            .is_some_and(|at| now.saturating_duration_since(at) > self.staleness_window)
    }

    /// Refreshes the stored stale flags, returning how many channels went stale.
    pub fn refresh_staleness(&mut self, now: Instant) -> usize {
        let window = self.staleness_window;
        let mut newly_stale = 0;
        for (key, entry) in self.entries.iter_mut() {
            let stale = entry
                .updated_at
                .is_some_and(|at| now.saturating_duration_since(at) > window);
            if stale && !entry.stale {
                warn!("{} has not been updated for over {:?}", key, window);
                newly_stale += 1;
            }
            entry.stale = stale;
        }
        newly_stale
    }

    pub fn reading(&self, key: ChannelKey) -> Option<&Reading> {
        self.entries.get(&key).and_then(|entry| entry.reading.as_ref())
    }

    pub fn channel(&self, key: ChannelKey) -> Option<&Channel> {
        self.entries.get(&key).map(|entry| &entry.channel)
    }

    /// Tracked channels in catalogue key order.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> + '_ {
        self.entries.values().map(|entry| &entry.channel)
    }

    /// Time of the most recent successful update on any channel.
    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }
}

fn decode(channel: &Channel, payload: &[u8]) -> DecodeResult {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Reading::Unavailable);
    }

    let document: Value = serde_json::from_slice(payload)?;
    let value = document.get("value").ok_or(DecodeError::MissingValue)?;
    if value.is_null() {
        return Ok(Reading::Unavailable);
    }

    let mismatch = |expected| DecodeError::TypeMismatch {
        key: channel.key,
        expected,
        found: value.to_string(),
    };

    match channel.kind {
        ChannelKind::Numeric => value
            .as_f64()
            .map(Reading::Number)
            .ok_or_else(|| mismatch("a number")),
        ChannelKind::Enumerated => value
            .as_i64()
            .or_else(|| value.as_f64().filter(|v| v.fract() == 0.0).map(|v| v as i64))
            .map(Reading::State)
            .ok_or_else(|| mismatch("an integer state")),
        ChannelKind::Text => match value {
            Value::String(text) => Ok(Reading::Text(text.clone())),
            Value::Number(number) => Ok(Reading::Text(number.to_string())),
            _ => Err(mismatch("a string")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Unit;

    const WINDOW: Duration = Duration::from_secs(120);

    fn channel(key: ChannelKey, kind: ChannelKind, enabled: bool) -> Channel {
        Channel {
            key,
            kind,
            unit: Unit::None,
            enabled,
            discovery: false,
            controllable: false,
            template: "N/{installation}/test",
        }
    }

    fn store() -> TelemetryStore {
        TelemetryStore::new(
            &[
                channel(ChannelKey::GridL1Power, ChannelKind::Numeric, true),
                channel(ChannelKey::GridL2Power, ChannelKind::Numeric, false),
                channel(ChannelKey::ChargeState, ChannelKind::Enumerated, true),
                channel(ChannelKey::SystemSerial, ChannelKind::Text, true),
            ],
            WINDOW,
        )
    }

    #[test]
    fn test_decodes_each_kind() {
        let mut store = store();
        let now = Instant::now();

        let reading = store
            .update(ChannelKey::GridL1Power, br#"{"value": 1234.5}"#, now)
            .unwrap();
        assert_eq!(reading, Reading::Number(1234.5));

        let reading = store
            .update(ChannelKey::ChargeState, br#"{"value": 5}"#, now)
            .unwrap();
        assert_eq!(reading, Reading::State(5));

        let reading = store
            .update(ChannelKey::SystemSerial, br#"{"value": "c0619ab1cafe"}"#, now)
            .unwrap();
        assert_eq!(reading, Reading::Text("c0619ab1cafe".to_string()));
        assert_eq!(store.last_update(), Some(now));
    }

    #[test]
    fn test_null_and_empty_payloads_are_unavailable() {
        let mut store = store();
        let now = Instant::now();
        store
            .update(ChannelKey::GridL1Power, br#"{"value": 10}"#, now)
            .unwrap();

        let reading = store
            .update(ChannelKey::GridL1Power, br#"{"value": null}"#, now)
            .unwrap();
        assert_eq!(reading, Reading::Unavailable);

        let reading = store.update(ChannelKey::GridL1Power, b"", now).unwrap();
        assert_eq!(reading, Reading::Unavailable);
    }

    #[test]
    fn test_malformed_payload_keeps_previous_value() {
        let mut store = store();
        let now = Instant::now();
        store
            .update(ChannelKey::GridL1Power, br#"{"value": 42}"#, now)
            .unwrap();

        let later = now + Duration::from_secs(5);
        assert!(matches!(
            store.update(ChannelKey::GridL1Power, b"{not json", later),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            store.update(ChannelKey::GridL1Power, br#"{"value": "high"}"#, later),
            Err(DecodeError::TypeMismatch { .. })
        ));
        assert!(matches!(
            store.update(ChannelKey::GridL1Power, br#"{"val": 1}"#, later),
            Err(DecodeError::MissingValue)
        ));

        assert_eq!(
            store.reading(ChannelKey::GridL1Power),
            Some(&Reading::Number(42.0))
        );
        assert_eq!(store.last_update(), Some(now));
        assert_eq!(store.decode_failures(), 3);
    }

    #[test]
    fn test_disabled_channel_is_never_written() {
        let mut store = store();
        let result = store.update(ChannelKey::GridL2Power, br#"{"value": 1}"#, Instant::now());
        assert!(matches!(result, Err(DecodeError::Disabled(ChannelKey::GridL2Power))));
        assert_eq!(store.reading(ChannelKey::GridL2Power), None);
        assert_eq!(store.last_update(), None);
        assert_eq!(store.decode_failures(), 0);
    }

    #[test]
    fn test_untracked_channel() {
        let mut store = store();
        let result = store.update(ChannelKey::VebusMode, br#"{"value": 3}"#, Instant::now());
        assert!(matches!(result, Err(DecodeError::Untracked(_))));
    }

    #[test]
    fn test_staleness_and_recovery() {
        let mut store = store();
        let start = Instant::now();
        assert!(!store.is_stale(ChannelKey::GridL1Power, start));

        store
            .update(ChannelKey::GridL1Power, br#"{"value": 1}"#, start)
            .unwrap();
        assert!(!store.is_stale(ChannelKey::GridL1Power, start + WINDOW));

        let late = start + WINDOW + Duration::from_secs(1);
        assert!(store.is_stale(ChannelKey::GridL1Power, late));
        assert_eq!(store.refresh_staleness(late), 1);
        assert_eq!(store.refresh_staleness(late), 0);

        store
            .update(ChannelKey::GridL1Power, br#"{"value": 2}"#, late)
            .unwrap();
        assert!(!store.is_stale(ChannelKey::GridL1Power, late));
    }

    #[test]
    fn test_enumerated_accepts_integral_floats() {
        let mut store = store();
        let reading = store
            .update(ChannelKey::ChargeState, br#"{"value": 3.0}"#, Instant::now())
            .unwrap();
        assert_eq!(reading, Reading::State(3));
        assert!(store
            .update(ChannelKey::ChargeState, br#"{"value": 3.5}"#, Instant::now())
            .is_err());
    }
}
