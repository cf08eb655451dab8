use crate::ports::LightSensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorReading {
    Value(u16),
    Unavailable,
}

impl SensorReading {
    pub fn value(self) -> Option<u16> {
        match self {
            Self::Value(value) => Some(value),
            Self::Unavailable => None,
        }
    }
}

/// Rate-limited light sensor source.
#[derive(Debug, Clone)]
pub struct SensorSampler {
    interval_ms: u64,
    max_value: u16,
    last_sample_ms: Option<u64>,
    latest: Option<u16>,
}

impl SensorSampler {
    pub fn new(interval_ms: u64, max_value: u16) -> Self {
        Self {
            interval_ms,
            max_value,
            last_sample_ms: None,
            latest: None,
        }
    }

    /// Last good reading; survives unavailable samples.
    pub fn latest(&self) -> Option<u16> {
        self.latest
    }

    pub fn maybe_sample<S: LightSensor + ?Sized>(
        &mut self,
        now_ms: u64,
        sensor: &mut S,
    ) -> Option<SensorReading> {
        if let Some(last) = self.last_sample_ms {
            if now_ms.saturating_sub(last) < self.interval_ms {
                return None;
            }
        }
        self.last_sample_ms = Some(now_ms);

        let reading = match sensor.read_analog() {
            Some(value) if value <= self.max_value => SensorReading::Value(value),
            _ => SensorReading::Unavailable,
        };

        if let SensorReading::Value(value) = reading {
            self.latest = Some(value);
        }
        Some(reading)
    }
}
