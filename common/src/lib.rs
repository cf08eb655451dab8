pub mod config;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod led;
pub mod link;
pub mod ports;
pub mod runtime;
pub mod sampler;
pub mod sync;
pub mod topics;
pub mod types;

pub use config::{DeviceConfig, NetworkConfig, RuntimeConfig};
pub use debounce::{ActiveLevel, Debouncer, Edge};
pub use engine::{DeviceAction, DeviceEngine};
pub use error::{DecodeError, DeviceError, LinkError};
pub use led::{derive_led, LedController};
pub use link::{EventLink, InboundMessage, Link, LinkSupervisor, LinkTransition, TelemetryLink};
pub use ports::{Board, ButtonInput, LedOutput, LightSensor, PresentationSink};
pub use runtime::DeviceRuntime;
pub use sampler::{SensorReading, SensorSampler};
pub use sync::{
    BridgeStats, Delivery, EventSource, Field, MilestoneEvent, OutboundEvent, RemoteCommand,
    RemoteSyncBridge, MAX_REMOTE_PAYLOAD_BYTES,
};
pub use topics::*;
pub use types::{DisplaySnapshot, LedMode, LinkStatus, StateSnapshot};
