//! Outbound command path for controllable channels (Multiplus mode).
//!
//! The vebus `Mode` register folds charger and inverter into one value.
//! Commands are validated here and published fire-and-forget; the next
//! `N/.../Mode` update confirms the new state.

use crate::mqtt::topics::{Identifier, Identifiers};
use std::fmt;
use thiserror::Error;

/// Input from the (external, debounced) button collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonEvent {
    Wake,
    ToggleCharger,
    ToggleInverter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VebusMode {
    ChargerOnly,
    InverterOnly,
    On,
    Off,
}

impl VebusMode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(VebusMode::ChargerOnly),
            2 => Some(VebusMode::InverterOnly),
            3 => Some(VebusMode::On),
            4 => Some(VebusMode::Off),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            VebusMode::ChargerOnly => 1,
            VebusMode::InverterOnly => 2,
            VebusMode::On => 3,
            VebusMode::Off => 4,
        }
    }

    pub fn from_parts(charger: bool, inverter: bool) -> Self {
        match (charger, inverter) {
            (true, true) => VebusMode::On,
            (true, false) => VebusMode::ChargerOnly,
            (false, true) => VebusMode::InverterOnly,
            (false, false) => VebusMode::Off,
        }
    }

    pub fn charger_on(&self) -> bool {
        matches!(self, VebusMode::On | VebusMode::ChargerOnly)
    }

    pub fn inverter_on(&self) -> bool {
        matches!(self, VebusMode::On | VebusMode::InverterOnly)
    }
}

impl fmt::Display for VebusMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VebusMode::ChargerOnly => write!(f, "Charger only"),
            VebusMode::InverterOnly => write!(f, "Inverter only"),
            VebusMode::On => write!(f, "On"),
            VebusMode::Off => write!(f, "Off"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    SetMode(VebusMode),
    SetCharger(bool),
    SetInverter(bool),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("mode changes are disabled in the configuration")]
    Disabled,

    #[error("{0} is not known yet")]
    Unresolved(Identifier),

    #[error("current Multiplus mode is unknown")]
    UnknownCurrentMode,

    #[error("not connected to the broker")]
    NotConnected,
}

/// A validated write, ready to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModeWrite {
    pub topic: String,
    pub payload: String,
    pub mode: VebusMode,
}

#[derive(Clone, Debug)]
pub struct CommandPath {
    allowed: bool,
}

impl CommandPath {
    pub fn new(allowed: bool) -> Self {
        Self { allowed }
    }

    /// Validates `command` against the current mode and known identifiers.
    pub fn prepare(
        &self,
        command: ControlCommand,
        current: Option<VebusMode>,
        ids: &Identifiers,
    ) -> Result<ModeWrite, CommandError> {
        if !self.allowed {
            return Err(CommandError::Disabled);
        }

        let mode = match command {
            ControlCommand::SetMode(mode) => mode,
            ControlCommand::SetCharger(on) => {
                let current = current.ok_or(CommandError::UnknownCurrentMode)?;
                VebusMode::from_parts(on, current.inverter_on())
            }
            ControlCommand::SetInverter(on) => {
                let current = current.ok_or(CommandError::UnknownCurrentMode)?;
                VebusMode::from_parts(current.charger_on(), on)
            }
        };

        let installation = ids
            .get(Identifier::Installation)
            .ok_or(CommandError::Unresolved(Identifier::Installation))?;
        let vebus = ids
            .get(Identifier::Vebus)
            .ok_or(CommandError::Unresolved(Identifier::Vebus))?;

        Ok(ModeWrite {
            topic: format!("W/{}/vebus/{}/Mode", installation, vebus),
            payload: serde_json::json!({ "value": mode.code() }).to_string(),
            mode,
        })
    }

    /// Command for a toggle button given the current mode.
    pub fn toggle(
        button: ButtonEvent,
        current: Option<VebusMode>,
    ) -> Option<Result<ControlCommand, CommandError>> {
        let current = current.ok_or(CommandError::UnknownCurrentMode);
        match button {
            ButtonEvent::Wake => None,
            ButtonEvent::ToggleCharger => {
                Some(current.map(|mode| ControlCommand::SetCharger(!mode.charger_on())))
            }
            ButtonEvent::ToggleInverter => {
                Some(current.map(|mode| ControlCommand::SetInverter(!mode.inverter_on())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Identifiers {
        Identifiers::from_config("abc", "276")
    }

    #[test]
    fn test_mode_codes() {
        for code in 1..=4 {
            assert_eq!(VebusMode::from_code(code).map(|m| m.code()), Some(code));
        }
        assert_eq!(VebusMode::from_code(0), None);
        assert_eq!(VebusMode::from_code(5), None);
    }

    #[test]
    fn test_set_charger_keeps_inverter_half() {
        let path = CommandPath::new(true);
        let write = path
            .prepare(ControlCommand::SetCharger(false), Some(VebusMode::On), &ids())
            .unwrap();
        assert_eq!(write.mode, VebusMode::InverterOnly);
        assert_eq!(write.topic, "W/abc/vebus/276/Mode");
        assert_eq!(write.payload, r#"{"value":2}"#);

        let write = path
            .prepare(ControlCommand::SetInverter(true), Some(VebusMode::Off), &ids())
            .unwrap();
        assert_eq!(write.mode, VebusMode::InverterOnly);
    }

    #[test]
    fn test_rejections() {
        let path = CommandPath::new(false);
        assert_eq!(
            path.prepare(ControlCommand::SetMode(VebusMode::On), None, &ids()),
            Err(CommandError::Disabled)
        );

        let path = CommandPath::new(true);
        assert_eq!(
            path.prepare(ControlCommand::SetCharger(true), None, &ids()),
            Err(CommandError::UnknownCurrentMode)
        );
        assert_eq!(
            path.prepare(
                ControlCommand::SetMode(VebusMode::Off),
                None,
                &Identifiers::from_config("abc", "+")
            ),
            Err(CommandError::Unresolved(Identifier::Vebus))
        );
    }

    #[test]
    fn test_toggle_buttons() {
        assert_eq!(CommandPath::toggle(ButtonEvent::Wake, Some(VebusMode::On)), None);
        assert_eq!(
            CommandPath::toggle(ButtonEvent::ToggleCharger, Some(VebusMode::On)),
            Some(Ok(ControlCommand::SetCharger(false)))
        );
        assert_eq!(
            CommandPath::toggle(ButtonEvent::ToggleInverter, Some(VebusMode::ChargerOnly)),
            Some(Ok(ControlCommand::SetInverter(true)))
        );
        assert_eq!(
            CommandPath::toggle(ButtonEvent::ToggleInverter, None),
            Some(Err(CommandError::UnknownCurrentMode))
        );
    }
}
