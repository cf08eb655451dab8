use thiserror::Error;

/// Failures reported by a network link adapter. All of them are transient.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe to `{field}` failed: {reason}")]
    Subscribe { field: String, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
    #[error("payload is not valid utf-8")]
    NotUtf8,
    #[error("payload `{0}` is not a number")]
    NotNumeric(String),
}

/// Unrecoverable startup failures. The device halts on these.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{component} initialization failed: {reason}")]
    HardwareInit {
        component: &'static str,
        reason: String,
    },
}
