use crate::types::LedMode;

/// LED output for a given mode and light reading.
///
/// In sensor-driven mode the LED lights while the reading is below the
/// threshold; an unknown reading keeps `previous` (last-known-good).
pub fn derive_led(mode: LedMode, reading: Option<u16>, threshold: u16, previous: bool) -> bool {
    match mode {
        LedMode::Off => false,
        LedMode::On => true,
        LedMode::SensorDriven => match reading {
            Some(value) => value < threshold,
            None => previous,
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedController {
    led_on: bool,
}

impl LedController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        self.led_on
    }

    pub fn apply_mode(&mut self, mode: LedMode, reading: Option<u16>, threshold: u16) -> bool {
        self.led_on = derive_led(mode, reading, threshold, self.led_on);
        self.led_on
    }

    /// Direct override from the remote mirror. Returns false when nothing changed.
    pub fn force(&mut self, on: bool) -> bool {
        if self.led_on == on {
            return false;
        }
        self.led_on = on;
        true
    }
}
