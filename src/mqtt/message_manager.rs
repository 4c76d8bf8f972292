use chrono::{DateTime, Local};
use std::fmt;

const PREVIEW_LEN: usize = 40;

/// One inbound publish from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl BusMessage {
    pub fn new(topic: String, payload: Vec<u8>) -> Self {
        BusMessage {
            topic,
            payload,
            received_at: Local::now(),
        }
    }

    fn preview(&self) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        match text.char_indices().nth(PREVIEW_LEN) {
            Some((cut, _)) => format!("{}...", &text[..cut]),
            None => text.into_owned(),
        }
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.preview()
        )
    }
}

/// What one poll of the session produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    /// CONNACK received; subscriptions must be (re)issued.
    Connected,
    Message(BusMessage),
    /// Protocol traffic with nothing for the application.
    Idle,
}
