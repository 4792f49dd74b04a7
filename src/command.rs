use crate::prelude::*;

/// Everything that can be asked of a device from outside the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SwitchToLine,
    SwitchToBattery,
    /// Optional maximum charge current in amps; snapped to what the device accepts.
    TurnOnGridCharging(Option<u16>),
    TurnOffGridCharging,
}

impl Command {
    pub const NAMES: [&'static str; 4] = [
        "SWITCH_TO_LINE",
        "SWITCH_TO_BATTERY",
        "TURN_ON_GRID_CHARGING",
        "TURN_OFF_GRID_CHARGING",
    ];

    pub fn name(&self) -> &'static str {
        use Command::*;

        match self {
            SwitchToLine => Self::NAMES[0],
            SwitchToBattery => Self::NAMES[1],
            TurnOnGridCharging(_) => Self::NAMES[2],
            TurnOffGridCharging => Self::NAMES[3],
        }
    }

    /// Builds a command from its API name. The numeric argument is only
    /// meaningful for `TURN_ON_GRID_CHARGING` and is ignored otherwise.
    pub fn from_name(name: &str, arg: Option<u16>) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SWITCH_TO_LINE" => Ok(Command::SwitchToLine),
            "SWITCH_TO_BATTERY" => Ok(Command::SwitchToBattery),
            "TURN_ON_GRID_CHARGING" => Ok(Command::TurnOnGridCharging(arg)),
            "TURN_OFF_GRID_CHARGING" => Ok(Command::TurnOffGridCharging),
            _ => bail!("unknown command {}", name),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::TurnOnGridCharging(Some(current)) => write!(f, "{}({}A)", self.name(), current),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Outcome handed back to the API layer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CommandReport {
    pub success: bool,
    pub detail: String,
}

impl CommandReport {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for name in Command::NAMES {
            assert_eq!(Command::from_name(name, None).unwrap().name(), name);
        }
    }

    #[test]
    fn grid_charging_keeps_current() {
        assert_eq!(
            Command::from_name("turn_on_grid_charging", Some(30)).unwrap(),
            Command::TurnOnGridCharging(Some(30))
        );
    }

    #[test]
    fn rejects_unknown() {
        assert!(Command::from_name("SELF_DESTRUCT", None).is_err());
    }
}
