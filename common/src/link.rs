//! Network link capabilities and the per-link reconnect state machine.

use log::{debug, info, warn};
use serde_json::{Map, Value};

use crate::{error::LinkError, sync::RemoteCommand, types::LinkStatus};

pub trait Link {
    fn is_connected(&self) -> bool;

    /// Starts (or nudges) a connection attempt. Must not block the tick.
    fn connect(&mut self) -> Result<(), LinkError>;
}

/// Device-telemetry channel carrying the remote mirror of the device state.
pub trait TelemetryLink: Link {
    fn publish(&mut self, device_label: &str, payload: &Map<String, Value>)
        -> Result<(), LinkError>;

    fn subscribe(&mut self, field: &str) -> Result<(), LinkError>;

    /// Remote updates received since the last call, already decoded.
    fn take_commands(&mut self) -> Vec<RemoteCommand>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Event-notification channel.
pub trait EventLink: Link {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError>;

    /// Called from the tick after the link comes up, never from a transport callback.
    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError>;

    fn take_messages(&mut self) -> Vec<InboundMessage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    Up,
    Lost,
}

#[derive(Debug, Clone)]
pub struct LinkSupervisor {
    name: &'static str,
    status: LinkStatus,
    attempts: u64,
    last_error: Option<String>,
}

impl LinkSupervisor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            status: LinkStatus::Disconnected,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_up(&self) -> bool {
        self.status == LinkStatus::Connected
    }

    /// Attempts since the link was last up.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// One supervision pass. A link that is down gets a connect attempt on
    /// every call; there is no backoff and no attempt limit.
    pub fn poll<L: Link + ?Sized>(&mut self, link: &mut L) -> Option<LinkTransition> {
        if link.is_connected() {
            return self.mark_up();
        }

        let was_up = self.status == LinkStatus::Connected;
        if was_up {
            warn!("{} link lost; reconnecting", self.name);
        }

        self.status = LinkStatus::Connecting;
        self.attempts = self.attempts.saturating_add(1);

        match link.connect() {
            Ok(()) if link.is_connected() => return self.mark_up(),
            Ok(()) => {}
            Err(err) => {
                debug!(
                    "{} link connect attempt {} failed: {err}",
                    self.name, self.attempts
                );
                self.last_error = Some(err.to_string());
                self.status = LinkStatus::Disconnected;
            }
        }

        was_up.then_some(LinkTransition::Lost)
    }

    fn mark_up(&mut self) -> Option<LinkTransition> {
        if self.status == LinkStatus::Connected {
            return None;
        }
        info!(
            "{} link connected after {} attempt(s)",
            self.name, self.attempts
        );
        self.status = LinkStatus::Connected;
        self.attempts = 0;
        self.last_error = None;
        Some(LinkTransition::Up)
    }
}
