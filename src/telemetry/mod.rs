//! Logical channels mirrored from the Venus bus
//!
//! A [`Channel`] is one sensor or actuator the display cares about. The
//! catalogue is fixed; installation configuration only decides which
//! channels are enabled. Enabled channels get a topic binding in the
//! resolver and a slot in the [`store::TelemetryStore`].

pub mod format;
pub mod store;

use crate::config::{AdditionalInfo, ControlConfig, DisplayConfig, InstallationConfig};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKey {
    SystemSerial,
    GridL1Power,
    GridL2Power,
    GridL3Power,
    PvPower,
    AcOutL1Power,
    AcOutL2Power,
    AcOutL3Power,
    BatterySoc,
    BatteryTimeToGo,
    ChargeState,
    BatteryTemperature,
    BatteryPower,
    VebusMode,
}

impl ChannelKey {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelKey::SystemSerial => "Serial",
            ChannelKey::GridL1Power => "Grid L1",
            ChannelKey::GridL2Power => "Grid L2",
            ChannelKey::GridL3Power => "Grid L3",
            ChannelKey::PvPower => "Solar",
            ChannelKey::AcOutL1Power => "AC Out L1",
            ChannelKey::AcOutL2Power => "AC Out L2",
            ChannelKey::AcOutL3Power => "AC Out L3",
            ChannelKey::BatterySoc => "Battery",
            ChannelKey::BatteryTimeToGo => "Time to go",
            ChannelKey::ChargeState => "Charging",
            ChannelKey::BatteryTemperature => "Battery temp",
            ChannelKey::BatteryPower => "Battery power",
            ChannelKey::VebusMode => "Multiplus mode",
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// How a payload value is decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Numeric,
    /// Integer state code, e.g. charger state or vebus mode.
    Enumerated,
    Text,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unit {
    None,
    Watt,
    Percent,
    Seconds,
    Celsius,
}

impl Unit {
    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::Watt => "W",
            Unit::Percent => "%",
            Unit::Seconds => "s",
            Unit::Celsius => "°C",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    pub key: ChannelKey,
    pub kind: ChannelKind,
    pub unit: Unit,
    pub enabled: bool,
    /// Subscribed with wildcards while its identifiers are unknown, so
    /// its traffic can resolve them.
    pub discovery: bool,
    pub controllable: bool,
    /// Topic template with `{installation}` / `{vebus}` placeholders.
    pub template: &'static str,
}

impl Channel {
    fn new(
        key: ChannelKey,
        kind: ChannelKind,
        unit: Unit,
        template: &'static str,
        enabled: bool,
    ) -> Self {
        Self {
            key,
            kind,
            unit,
            enabled,
            discovery: false,
            controllable: false,
            template,
        }
    }

    fn discovery(mut self) -> Self {
        self.discovery = true;
        self
    }

    fn controllable(mut self) -> Self {
        self.controllable = true;
        self
    }
}

/// Builds the full channel catalogue with enable flags applied.
pub fn catalogue(
    installation: &InstallationConfig,
    display: &DisplayConfig,
    control: &ControlConfig,
) -> Vec<Channel> {
    use ChannelKind::*;
    let info = display.additional_info;
    let show_mode =
        display.show_charger_mode || display.show_inverter_mode || control.allow_mode_changes;

    vec![
        Channel::new(
            ChannelKey::SystemSerial,
            Text,
            Unit::None,
            "N/{installation}/system/0/Serial",
            true,
        )
        .discovery(),
        Channel::new(
            ChannelKey::GridL1Power,
            Numeric,
            Unit::Watt,
            "N/{installation}/system/0/Ac/Grid/L1/Power",
            installation.grid_l1_used,
        ),
        Channel::new(
            ChannelKey::GridL2Power,
            Numeric,
            Unit::Watt,
            "N/{installation}/system/0/Ac/Grid/L2/Power",
            installation.grid_l2_used,
        ),
        Channel::new(
            ChannelKey::GridL3Power,
            Numeric,
            Unit::Watt,
            "N/{installation}/system/0/Ac/Grid/L3/Power",
            installation.grid_l3_used,
        ),
        Channel::new(
            ChannelKey::PvPower,
            Numeric,
            Unit::Watt,
            "N/{installation}/system/0/Dc/Pv/Power",
            installation.pv_used,
        ),
        Channel::new(
            ChannelKey::AcOutL1Power,
            Numeric,
            Unit::Watt,
            "N/{installation}/system/0/Ac/ConsumptionOnOutput/L1/Power",
            installation.ac_out_l1_used,
        ),
        Channel::new(
            ChannelKey::AcOutL2Power,
            Numeric,
            Unit::Watt,
            "N/{installation}/system/0/Ac/ConsumptionOnOutput/L2/Power",
            installation.ac_out_l2_used,
        ),
        Channel::new(
            ChannelKey::AcOutL3Power,
            Numeric,
            Unit::Watt,
            "N/{installation}/system/0/Ac/ConsumptionOnOutput/L3/Power",
            installation.ac_out_l3_used,
        ),
        Channel::new(
            ChannelKey::BatterySoc,
            Numeric,
            Unit::Percent,
            "N/{installation}/system/0/Dc/Battery/Soc",
            true,
        ),
        Channel::new(
            ChannelKey::BatteryTimeToGo,
            Numeric,
            Unit::Seconds,
            "N/{installation}/system/0/Dc/Battery/TimeToGo",
            info == AdditionalInfo::TimeToGo,
        ),
        Channel::new(
            ChannelKey::ChargeState,
            Enumerated,
            Unit::None,
            "N/{installation}/system/0/SystemState/State",
            info == AdditionalInfo::ChargeState,
        ),
        Channel::new(
            ChannelKey::BatteryTemperature,
            Numeric,
            Unit::Celsius,
            "N/{installation}/system/0/Dc/Battery/Temperature",
            info == AdditionalInfo::Temperature,
        ),
        Channel::new(
            ChannelKey::BatteryPower,
            Numeric,
            Unit::Watt,
            "N/{installation}/system/0/Dc/Battery/Power",
            info == AdditionalInfo::BatteryPower,
        ),
        Channel::new(
            ChannelKey::VebusMode,
            Enumerated,
            Unit::None,
            "N/{installation}/vebus/{vebus}/Mode",
            show_mode,
        )
        .discovery()
        .controllable(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(channels: &[Channel]) -> Vec<ChannelKey> {
        channels.iter().filter(|c| c.enabled).map(|c| c.key).collect()
    }

    #[test]
    fn test_default_catalogue() {
        let channels = catalogue(
            &InstallationConfig::default(),
            &DisplayConfig::default(),
            &ControlConfig::default(),
        );
        let keys = enabled(&channels);
        assert!(keys.contains(&ChannelKey::ChargeState));
        assert!(keys.contains(&ChannelKey::VebusMode));
        assert!(!keys.contains(&ChannelKey::BatteryTimeToGo));
        assert!(!keys.contains(&ChannelKey::BatteryTemperature));
    }

    #[test]
    fn test_unused_lines_are_disabled() {
        let installation = InstallationConfig {
            grid_l2_used: false,
            grid_l3_used: false,
            ac_out_l2_used: false,
            ac_out_l3_used: false,
            ..InstallationConfig::default()
        };
        let channels = catalogue(
            &installation,
            &DisplayConfig::default(),
            &ControlConfig::default(),
        );
        let keys = enabled(&channels);
        assert!(keys.contains(&ChannelKey::GridL1Power));
        assert!(!keys.contains(&ChannelKey::GridL2Power));
        assert!(!keys.contains(&ChannelKey::AcOutL3Power));
    }

    #[test]
    fn test_mode_channel_needs_a_consumer() {
        let display = DisplayConfig {
            show_charger_mode: false,
            show_inverter_mode: false,
            ..DisplayConfig::default()
        };
        let control = ControlConfig {
            allow_mode_changes: false,
        };
        let channels = catalogue(&InstallationConfig::default(), &display, &control);
        assert!(!enabled(&channels).contains(&ChannelKey::VebusMode));
    }

    #[test]
    fn test_only_serial_and_mode_are_discovery_channels() {
        let channels = catalogue(
            &InstallationConfig::default(),
            &DisplayConfig::default(),
            &ControlConfig::default(),
        );
        let discovery: Vec<_> = channels
            .iter()
            .filter(|c| c.discovery)
            .map(|c| c.key)
            .collect();
        assert_eq!(discovery, vec![ChannelKey::SystemSerial, ChannelKey::VebusMode]);
    }
}
