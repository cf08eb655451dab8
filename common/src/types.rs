use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedMode {
    #[default]
    Off,
    On,
    SensorDriven,
}

impl LedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
            Self::SensorDriven => "SENSOR_DRIVEN",
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::On => 1,
            Self::SensorDriven => 2,
        }
    }

    /// Clamps an arbitrary remote value into the three known modes.
    pub fn from_raw(raw: i64) -> Self {
        match raw.clamp(0, 2) {
            0 => Self::Off,
            1 => Self::On,
            _ => Self::SensorDriven,
        }
    }

    pub fn next(self) -> Self {
        match self {
            Self::Off => Self::On,
            Self::On => Self::SensorDriven,
            Self::SensorDriven => Self::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

/// Full copy of the reconciled device state, attached to every outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub mode: LedMode,
    #[serde(rename = "ledOn")]
    pub led_on: bool,
    pub threshold: u16,
    #[serde(rename = "buttonClicks")]
    pub button_clicks: u32,
    pub light: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplaySnapshot {
    #[serde(rename = "rawSensorReading")]
    pub light: Option<u16>,
    pub mode: &'static str,
    #[serde(rename = "ledState")]
    pub led_on: bool,
    #[serde(rename = "buttonClicks")]
    pub button_clicks: u32,
    #[serde(rename = "telemetryLink")]
    pub telemetry_link: &'static str,
    #[serde(rename = "eventLink")]
    pub event_link: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_mode_values_are_clamped() {
        assert_eq!(LedMode::from_raw(-4), LedMode::Off);
        assert_eq!(LedMode::from_raw(0), LedMode::Off);
        assert_eq!(LedMode::from_raw(1), LedMode::On);
        assert_eq!(LedMode::from_raw(2), LedMode::SensorDriven);
        assert_eq!(LedMode::from_raw(17), LedMode::SensorDriven);
    }

    #[test]
    fn next_cycles_through_all_modes() {
        let mut mode = LedMode::Off;
        let mut seen = Vec::new();
        for _ in 0..4 {
            mode = mode.next();
            seen.push(mode.index());
        }
        assert_eq!(seen, vec![1, 2, 0, 1]);
    }
}
