//! Static installation configuration
//!
//! Everything tunable lives in one TOML file. Each section falls back to
//! its defaults so a partial (or missing) file still yields a usable
//! setup; only syntactically broken files stop startup.

use crate::mqtt::config::{KeepAliveConfig, MqttConfig};
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, Level};

const CONFIG_ENV: &str = "VENUS_REMOTE_CONFIG";
const CONFIG_DIR: &str = "venus-remote";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub mqtt: MqttConfig,
    pub keep_alive: KeepAliveConfig,
    pub telemetry: TelemetryConfig,
    pub installation: InstallationConfig,
    pub display: DisplayConfig,
    pub schedule: ScheduleConfig,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

/// Where the settings came from, reported once logging is up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettingsSource {
    File(PathBuf),
    Defaults(PathBuf),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub staleness_window_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            staleness_window_secs: 120,
        }
    }
}

impl TelemetryConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }
}

/// Which lines exist in this installation. Unused lines are never
/// subscribed, which keeps MQTT traffic down.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct InstallationConfig {
    pub grid_l1_used: bool,
    pub grid_l2_used: bool,
    pub grid_l3_used: bool,
    pub pv_used: bool,
    pub ac_out_l1_used: bool,
    pub ac_out_l2_used: bool,
    pub ac_out_l3_used: bool,
}

impl Default for InstallationConfig {
    fn default() -> Self {
        Self {
            grid_l1_used: true,
            grid_l2_used: true,
            grid_l3_used: true,
            pv_used: true,
            ac_out_l1_used: true,
            ac_out_l2_used: true,
            ac_out_l3_used: true,
        }
    }
}

/// Extra line shown under the battery percentage.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdditionalInfo {
    None,
    TimeToGo,
    #[default]
    ChargeState,
    Temperature,
    BatteryPower,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    pub seconds_between_updates: u64,
    pub report_kw_over_threshold: bool,
    pub kw_threshold_watts: f64,
    pub kw_decimal_places: usize,
    /// Round when true, truncate otherwise (9.55 -> 9.6 vs 9.5).
    pub round_numbers: bool,
    pub battery_yellow_at: f64,
    pub battery_red_at: f64,
    pub additional_info: AdditionalInfo,
    pub show_charger_mode: bool,
    pub show_inverter_mode: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            seconds_between_updates: 1,
            report_kw_over_threshold: true,
            kw_threshold_watts: 1000.0,
            kw_decimal_places: 1,
            round_numbers: true,
            battery_yellow_at: 40.0,
            battery_red_at: 20.0,
            additional_info: AdditionalInfo::default(),
            show_charger_mode: true,
            show_inverter_mode: true,
        }
    }
}

impl DisplayConfig {
    pub fn update_period(&self) -> Duration {
        Duration::from_secs(self.seconds_between_updates.max(1))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    /// When false the display never sleeps.
    pub display_at_specific_times_only: bool,
    pub use_deep_sleep: bool,
    /// "HH:MM", 24 hour clock.
    pub wake_time: String,
    pub sleep_time: String,
    pub boot_grace_secs: u64,
    pub manual_wake_secs: u64,
    pub initial_drift_ppm: f64,
    pub max_drift_ppm: f64,
    /// Weight of a new drift sample, 0..=1.
    pub drift_smoothing: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            display_at_specific_times_only: false,
            use_deep_sleep: true,
            wake_time: "06:15".to_string(),
            sleep_time: "23:45".to_string(),
            boot_grace_secs: 60,
            manual_wake_secs: 60,
            initial_drift_ppm: 0.0,
            max_drift_ppm: 50_000.0,
            drift_smoothing: 0.5,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub allow_mode_changes: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            allow_mode_changes: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// 0 quiet, 1 general, 2 verbose.
    pub debug_output_level: u8,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug_output_level: 1,
        }
    }
}

impl LoggingConfig {
    pub fn max_level(&self) -> Level {
        match self.debug_output_level {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    }
}

impl Settings {
    /// Loads the settings file, falling back to defaults when it does not exist.
    pub async fn load() -> Result<(Self, SettingsSource)> {
        let path = config_path();
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?
        {
            return Ok((Self::default(), SettingsSource::Defaults(path)));
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let settings = Self::parse(&content)
            .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;
        debug!("Loaded settings from {}", path.display());
        Ok((settings, SettingsSource::File(path)))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_sections_override_independently() {
        let settings = Settings::parse(
            r#"
            [mqtt]
            installation_id = "c0619ab1cafe"

            [display]
            round_numbers = false
            additional_info = "time_to_go"

            [schedule]
            display_at_specific_times_only = true
            wake_time = "22:00"
            sleep_time = "06:00"
            "#,
        )
        .unwrap();

        assert_eq!(settings.mqtt.installation_id, "c0619ab1cafe");
        assert_eq!(settings.mqtt.vebus_id, "+");
        assert!(!settings.display.round_numbers);
        assert_eq!(settings.display.additional_info, AdditionalInfo::TimeToGo);
        assert_eq!(settings.display.kw_decimal_places, 1);
        assert!(settings.schedule.display_at_specific_times_only);
        assert_eq!(settings.schedule.wake_time, "22:00");
        assert_eq!(settings.keep_alive, KeepAliveConfig::default());
    }

    #[test]
    fn test_unknown_additional_info_is_rejected() {
        assert!(Settings::parse("[display]\nadditional_info = \"weather\"").is_err());
    }

    #[test]
    fn test_debug_output_level_maps_to_tracing_level() {
        let level = |debug_output_level| LoggingConfig { debug_output_level }.max_level();
        assert_eq!(level(0), Level::WARN);
        assert_eq!(level(1), Level::INFO);
        assert_eq!(level(2), Level::DEBUG);
    }
}
