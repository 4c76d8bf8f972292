//! Bus session with a statum lifecycle
//!
//! ```text
//! Configured ──start()──► Running ──drain()──► Closed
//! ```
//!
//! `Running` owns the rumqttc event loop; the broker link inside it
//! comes and goes (rumqttc reconnects on the next poll) and is tracked in
//! [`SessionStatus`]. `drain()` must run before deep sleep or exit so the
//! broker sees a clean DISCONNECT.
//!
//! All requests use the non-blocking `try_*` client calls: the same task
//! polls the event loop, so awaiting a full request queue would deadlock.

use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use statum::{machine, state};
use tracing::{debug, info, warn};

use super::config::MqttConfig;
use super::message_manager::{BusEvent, BusMessage};

const REQUEST_CAPACITY: usize = 64;
const MIN_MQTT_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Never got a CONNACK (refused or timed out).
    Failed,
    /// Lost an established link; the next poll reconnects.
    Reconnecting,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("request rejected by client: {0}")]
    Request(#[from] rumqttc::ClientError),

    #[error("not connected to the broker")]
    NotConnected,
}

#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub connected_since: Option<Instant>,
    pub last_receive: Option<Instant>,
    pub last_publish: Option<Instant>,
    /// When the next keep-alive request is owed.
    pub keep_alive_deadline: Option<Instant>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub connection_failures: usize,
    pub last_error: Option<String>,
    stale: bool,
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Set by the watchdog. Only a received message clears it.
    pub fn mark_stale(&mut self) {
        if !self.stale {
            debug!("Session marked stale");
        }
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    fn record_connected(&mut self, now: Instant) {
        self.connection_state = ConnectionState::Connected;
        self.connected_since = Some(now);
        self.last_error = None;
    }

    fn record_receive(&mut self, now: Instant) {
        self.messages_received += 1;
        self.last_receive = Some(now);
        self.stale = false;
    }

    fn record_publish(&mut self, now: Instant) {
        self.messages_sent += 1;
        self.last_publish = Some(now);
    }

    fn record_failure(&mut self, error: &BusError) {
        self.connection_state = match self.connection_state {
            ConnectionState::Connected | ConnectionState::Reconnecting => {
                ConnectionState::Reconnecting
            }
            _ => ConnectionState::Failed,
        };
        self.connected_since = None;
        self.connection_failures += 1;
        self.last_error = Some(error.to_string());
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Configured,
    Running,
    Closed,
}

#[machine]
pub struct BusSession<S: SessionPhase> {
    client: AsyncClient,
    eventloop: EventLoop,
    status: SessionStatus,
    connect_timeout: Duration,
    keep_alive_payload: String,
}

impl<S: SessionPhase> BusSession<S> {
    pub fn status(&self) -> &SessionStatus {
        &self.status
    }
}

impl BusSession<Configured> {
    pub fn create(config: &MqttConfig) -> Self {
        info!(
            "Creating MQTT session for {}:{} as {}",
            config.broker, config.port, config.client_id
        );
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options
            .set_keep_alive(Duration::from_secs(
                config.mqtt_keep_alive_secs.max(MIN_MQTT_KEEP_ALIVE_SECS),
            ))
            .set_clean_session(true);
        if let Some((user, password)) = config.credentials() {
            options.set_credentials(user, password);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self::new(
            client,
            eventloop,
            SessionStatus::default(),
            config.connect_timeout(),
            config.keep_alive_payload.clone(),
        )
    }

    pub fn start(mut self) -> BusSession<Running> {
        self.status.connection_state = ConnectionState::Connecting;
        self.transition()
    }
}

impl BusSession<Running> {
    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn mark_stale(&mut self) {
        self.status.mark_stale();
    }

    /// Drives the event loop once. Connection attempts are bounded by the
    /// connect timeout; an established link is polled without one.
    pub async fn poll(&mut self) -> Result<BusEvent, BusError> {
        let event = if self.status.is_connected() {
            self.eventloop.poll().await
        } else {
            match tokio::time::timeout(self.connect_timeout, self.eventloop.poll()).await {
                Ok(event) => event,
                Err(_) => {
                    let error = BusError::ConnectTimeout(self.connect_timeout);
                    self.status.record_failure(&error);
                    return Err(error);
                }
            }
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to broker ({:?})", ack.code);
                self.status.record_connected(Instant::now());
                Ok(BusEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                self.status.record_receive(Instant::now());
                let message = BusMessage::new(publish.topic, publish.payload.to_vec());
                debug!("Received {}", message);
                Ok(BusEvent::Message(message))
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the session");
                Ok(BusEvent::Idle)
            }
            Ok(_) => Ok(BusEvent::Idle),
            Err(e) => {
                let error = BusError::from(e);
                self.status.record_failure(&error);
                Err(error)
            }
        }
    }

    pub fn subscribe(&mut self, filter: &str) -> Result<(), BusError> {
        debug!("Subscribing to {}", filter);
        self.client.try_subscribe(filter, QoS::AtMostOnce)?;
        Ok(())
    }

    pub fn unsubscribe(&mut self, filter: &str) -> Result<(), BusError> {
        debug!("Unsubscribing from {}", filter);
        self.client.try_unsubscribe(filter)?;
        Ok(())
    }

    /// Fire-and-forget write; the next telemetry update confirms it.
    pub fn publish_command(
        &mut self,
        topic: &str,
        payload: &str,
        now: Instant,
    ) -> Result<(), BusError> {
        info!("Publishing command {} {}", topic, payload);
        self.publish(topic, payload, now)
    }

    fn publish(&mut self, topic: &str, payload: &str, now: Instant) -> Result<(), BusError> {
        if !self.status.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())?;
        self.status.record_publish(now);
        debug!("Published {} {}", topic, payload);
        Ok(())
    }

    /// Asks Venus to keep publishing telemetry.
    pub fn publish_keep_alive(
        &mut self,
        installation: &str,
        now: Instant,
        next_due: Instant,
    ) -> Result<(), BusError> {
        let topic = keep_alive_topic(installation);
        let payload = self.keep_alive_payload.clone();
        self.publish(&topic, &payload, now)?;
        self.status.keep_alive_deadline = Some(next_due);
        Ok(())
    }

    /// Sends DISCONNECT and polls until it is flushed or `timeout` passes.
    pub async fn drain(mut self, timeout: Duration) -> BusSession<Closed> {
        if self.status.is_connected() {
            match self.client.try_disconnect() {
                Ok(()) => {
                    let eventloop = &mut self.eventloop;
                    let flushed = tokio::time::timeout(timeout, async {
                        loop {
                            match eventloop.poll().await {
                                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                                Ok(_) => continue,
                                Err(e) => {
                                    debug!("Event loop ended while draining: {}", e);
                                    break;
                                }
                            }
                        }
                    })
                    .await;
                    if flushed.is_err() {
                        warn!("Timed out flushing DISCONNECT after {:?}", timeout);
                    }
                }
                Err(e) => warn!("Failed to request DISCONNECT: {}", e),
            }
        }

        self.status.connection_state = ConnectionState::Disconnected;
        self.status.connected_since = None;
        info!(
            "Session closed ({} received, {} sent)",
            self.status.messages_received, self.status.messages_sent
        );
        self.transition()
    }
}

pub fn keep_alive_topic(installation: &str) -> String {
    format!("R/{}/keepalive", installation)
}
