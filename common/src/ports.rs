//! Hardware capabilities the core consumes. Boards implement these; the core
//! never touches a peripheral directly.

use crate::types::DisplaySnapshot;

pub trait ButtonInput {
    /// Raw electrical level of the button pin (`true` = high).
    fn read_level(&mut self) -> bool;
}

pub trait LightSensor {
    /// Raw analog reading, `None` when the conversion failed.
    fn read_analog(&mut self) -> Option<u16>;
}

pub trait LedOutput {
    /// Idempotent and fail-silent.
    fn write_led(&mut self, on: bool);
}

pub trait PresentationSink {
    fn render(&mut self, snapshot: &DisplaySnapshot);
}

/// Everything a board exposes to the tick loop.
pub trait Board: ButtonInput + LightSensor + LedOutput {}

impl<T: ButtonInput + LightSensor + LedOutput> Board for T {}
