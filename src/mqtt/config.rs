use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier value meaning "discover this from broker traffic".
pub const DISCOVER: &str = "+";

/// Broker connection and Venus identifiers.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub user: String,
    pub password: String,
    /// Portal / installation ID, or `+` to discover it.
    pub installation_id: String,
    /// Three character vebus (Multiplus) instance, or `+` to discover it.
    pub vebus_id: String,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    /// MQTT protocol keep-alive (PINGREQ), unrelated to the Venus keep-alive request.
    pub mqtt_keep_alive_secs: u64,
    pub keep_alive_payload: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "venus.local".to_string(),
            port: 1883,
            client_id: "venus-remote".to_string(),
            user: "Anonymous".to_string(),
            password: "Anonymous".to_string(),
            installation_id: DISCOVER.to_string(),
            vebus_id: DISCOVER.to_string(),
            connect_timeout_secs: 10,
            reconnect_delay_secs: 2,
            mqtt_keep_alive_secs: 15,
            keep_alive_payload: String::new(),
        }
    }
}

impl MqttConfig {
    /// Credentials to present to the broker, `None` for anonymous access.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.user.is_empty() || self.user.eq_ignore_ascii_case("anonymous") {
            None
        } else {
            Some((self.user.as_str(), self.password.as_str()))
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Venus keep-alive request policy.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Publish on every interval tick. When false another system is
    /// expected to keep Venus publishing and requests are only sent when
    /// telemetry dries up.
    pub periodic: bool,
    pub interval_ms: u64,
    pub grace_period_ms: u64,
    /// Silence after which "data updates have stopped" is shown.
    pub watchdog_ms: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            periodic: true,
            interval_ms: 30_000,
            grace_period_ms: 60_000,
            watchdog_ms: 90_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_user_means_no_credentials() {
        let config = MqttConfig::default();
        assert_eq!(config.credentials(), None);

        let config = MqttConfig {
            user: String::new(),
            ..MqttConfig::default()
        };
        assert_eq!(config.credentials(), None);

        let config = MqttConfig {
            user: "victron".to_string(),
            password: "secret".to_string(),
            ..MqttConfig::default()
        };
        assert_eq!(config.credentials(), Some(("victron", "secret")));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: MqttConfig = toml::from_str("broker = \"192.168.1.195\"").unwrap();
        assert_eq!(config.broker, "192.168.1.195");
        assert_eq!(config.port, 1883);
        assert_eq!(config.installation_id, DISCOVER);
    }
}
