//! Time-based debouncing of a noisy digital input.
//!
//! The debouncer is advanced with an explicit monotonic timestamp, so it never
//! reads a clock itself.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Pressed,
    Released,
}

/// Electrical level that means "pressed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveLevel {
    /// Pull-up wiring: the pin reads low while the button is held.
    Low,
    High,
}

impl ActiveLevel {
    pub fn from_active_low(active_low: bool) -> Self {
        if active_low {
            Self::Low
        } else {
            Self::High
        }
    }

    fn is_pressed(self, raw_level: bool) -> bool {
        match self {
            Self::Low => !raw_level,
            Self::High => raw_level,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    window_ms: u64,
    active: ActiveLevel,
    last_raw_pressed: Option<bool>,
    last_change_ms: u64,
    stable_pressed: bool,
}

impl Debouncer {
    pub fn new(window_ms: u64, active: ActiveLevel) -> Self {
        Self {
            window_ms,
            active,
            last_raw_pressed: None,
            last_change_ms: 0,
            stable_pressed: false,
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.stable_pressed
    }

    /// Feeds one raw pin reading; returns an edge once the new level has been
    /// steady for the whole debounce window.
    pub fn observe(&mut self, raw_level: bool, now_ms: u64) -> Option<Edge> {
        let pressed = self.active.is_pressed(raw_level);

        if self.last_raw_pressed != Some(pressed) {
            self.last_raw_pressed = Some(pressed);
            self.last_change_ms = now_ms;
        }

        if pressed == self.stable_pressed {
            return None;
        }

        if now_ms.saturating_sub(self.last_change_ms) < self.window_ms {
            return None;
        }

        self.stable_pressed = pressed;
        Some(if pressed {
            Edge::Pressed
        } else {
            Edge::Released
        })
    }
}
