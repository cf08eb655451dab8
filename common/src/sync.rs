//! Translation between the local device state and its remote mirrors.
//!
//! Inbound updates are decoded exactly once, at the link boundary, into
//! [`RemoteCommand`]. The engine applies them with echo suppression. Outbound
//! changes leave the engine as [`OutboundEvent`] / [`MilestoneEvent`] and are
//! handed to a link by [`RemoteSyncBridge`]. An event for a link that is down
//! is dropped, never queued.

use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::{
    error::DecodeError,
    link::{EventLink, TelemetryLink},
    topics::{
        event_inbox_topic, event_milestone_topic, event_status_topic, EVENT_STATUS_ONLINE,
        FIELD_BUTTON_CLICKS, FIELD_LED_STATE, FIELD_LIGHT, FIELD_MODE, FIELD_THRESHOLD,
        SUBSCRIBED_FIELDS,
    },
    types::{LedMode, StateSnapshot},
};

pub const MAX_REMOTE_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Mode(LedMode),
    Threshold(u16),
    LedState(bool),
}

impl RemoteCommand {
    /// Unknown field names yield `None`.
    pub fn decode(field: &str, raw: f64) -> Option<Self> {
        match field.to_ascii_lowercase().as_str() {
            FIELD_MODE => Some(Self::Mode(LedMode::from_raw(raw.round() as i64))),
            FIELD_THRESHOLD => Some(Self::Threshold(
                raw.round().clamp(0.0, f64::from(u16::MAX)) as u16,
            )),
            FIELD_LED_STATE => Some(Self::LedState(raw != 0.0)),
            _ => None,
        }
    }

    /// Decodes a raw broker payload: either a bare number (`"600"`,
    /// `"1.0"`) or an object carrying a numeric `value`.
    pub fn decode_payload(field: &str, payload: &[u8]) -> Result<Option<Self>, DecodeError> {
        if Self::decode(field, 0.0).is_none() {
            return Ok(None);
        }
        if payload.len() > MAX_REMOTE_PAYLOAD_BYTES {
            return Err(DecodeError::PayloadTooLarge(payload.len()));
        }

        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
        let trimmed = text.trim();

        let raw = trimmed
            .parse::<f64>()
            .ok()
            .or_else(|| {
                serde_json::from_str::<Value>(trimmed)
                    .ok()?
                    .get("value")?
                    .as_f64()
            })
            .filter(|value| value.is_finite())
            .ok_or_else(|| DecodeError::NotNumeric(trimmed.to_string()))?;

        Ok(Self::decode(field, raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Mode,
    LedState,
    Threshold,
    ButtonClicks,
    Light,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Mode,
        Field::LedState,
        Field::Threshold,
        Field::ButtonClicks,
        Field::Light,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Mode => FIELD_MODE,
            Self::LedState => FIELD_LED_STATE,
            Self::Threshold => FIELD_THRESHOLD,
            Self::ButtonClicks => FIELD_BUTTON_CLICKS,
            Self::Light => FIELD_LIGHT,
        }
    }

    fn value(self, snapshot: &StateSnapshot) -> Option<Value> {
        match self {
            Self::Mode => Some(json!(snapshot.mode.index())),
            Self::LedState => Some(json!(u8::from(snapshot.led_on))),
            Self::Threshold => Some(json!(snapshot.threshold)),
            Self::ButtonClicks => Some(json!(snapshot.button_clicks)),
            Self::Light => snapshot.light.map(|light| json!(light)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    ButtonClick,
    LedChangedBySensor,
    Resync,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ButtonClick => "button_click",
            Self::LedChangedBySensor => "led_changed_by_sensor",
            Self::Resync => "resync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    pub source: EventSource,
    pub changed: Vec<Field>,
    pub snapshot: StateSnapshot,
}

impl OutboundEvent {
    /// `field -> {"value", "context"}` map in the shape the device mirror expects.
    pub fn telemetry_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        for field in Field::ALL {
            let Some(value) = field.value(&self.snapshot) else {
                continue;
            };
            payload.insert(
                field.label().to_string(),
                json!({
                    "value": value,
                    "context": {
                        "source": self.source.as_str(),
                        "changed": self.changed.contains(&field),
                    },
                }),
            );
        }
        payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MilestoneEvent {
    pub clicks: u32,
    pub snapshot: StateSnapshot,
}

#[derive(Debug, Serialize)]
struct MilestonePayload<'a> {
    event: &'static str,
    device: &'a str,
    clicks: u32,
    state: &'a StateSnapshot,
    #[serde(rename = "sentAt", skip_serializing_if = "Option::is_none")]
    sent_at: Option<i64>,
}

impl MilestoneEvent {
    pub fn to_json(
        &self,
        device_label: &str,
        sent_at_ms: Option<i64>,
    ) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&MilestonePayload {
            event: "click_milestone",
            device: device_label,
            clicks: self.clicks,
            state: &self.snapshot,
            sent_at: sent_at_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryCounters {
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl DeliveryCounters {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Dropped => self.dropped += 1,
            Delivery::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub telemetry: DeliveryCounters,
    pub events: DeliveryCounters,
}

#[derive(Debug, Clone)]
pub struct RemoteSyncBridge {
    device_label: String,
    event_topic_prefix: String,
    stats: BridgeStats,
}

impl RemoteSyncBridge {
    pub fn new(device_label: impl Into<String>, event_topic_prefix: impl Into<String>) -> Self {
        Self {
            device_label: device_label.into(),
            event_topic_prefix: event_topic_prefix.into(),
            stats: BridgeStats::default(),
        }
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn publish_state<L: TelemetryLink + ?Sized>(
        &mut self,
        link: &mut L,
        event: &OutboundEvent,
    ) -> Delivery {
        let delivery = if !link.is_connected() {
            debug!(
                "telemetry link down; dropping {} event",
                event.source.as_str()
            );
            Delivery::Dropped
        } else {
            match link.publish(&self.device_label, &event.telemetry_payload()) {
                Ok(()) => Delivery::Delivered,
                Err(err) => {
                    warn!("{} event publish failed: {err}", event.source.as_str());
                    Delivery::Failed
                }
            }
        };
        self.stats.telemetry.record(delivery);
        delivery
    }

    pub fn publish_milestone<L: EventLink + ?Sized>(
        &mut self,
        link: &mut L,
        event: &MilestoneEvent,
        sent_at_ms: Option<i64>,
    ) -> Delivery {
        let delivery = if !link.is_connected() {
            debug!("event link down; dropping milestone at {} clicks", event.clicks);
            Delivery::Dropped
        } else {
            let topic = event_milestone_topic(&self.event_topic_prefix, &self.device_label);
            match event.to_json(&self.device_label, sent_at_ms) {
                Ok(body) => match link.publish(&topic, &body, false) {
                    Ok(()) => Delivery::Delivered,
                    Err(err) => {
                        warn!("milestone publish failed: {err}");
                        Delivery::Failed
                    }
                },
                Err(err) => {
                    warn!("milestone serialization failed: {err}");
                    Delivery::Failed
                }
            }
        };
        self.stats.events.record(delivery);
        delivery
    }

    /// Re-subscribes the mirrored fields; needed after every reconnect.
    pub fn subscribe_mirror<L: TelemetryLink + ?Sized>(&self, link: &mut L) {
        for field in SUBSCRIBED_FIELDS {
            if let Err(err) = link.subscribe(field) {
                warn!("telemetry subscribe failed: {err}");
            }
        }
    }

    pub fn announce_online<L: EventLink + ?Sized>(&self, link: &mut L) {
        let topic = event_status_topic(&self.event_topic_prefix, &self.device_label);
        if let Err(err) = link.publish(&topic, EVENT_STATUS_ONLINE.as_bytes(), true) {
            warn!("failed to publish online status: {err}");
        }
    }

    /// Joins the device inbox; needed after every reconnect.
    pub fn subscribe_inbox<L: EventLink + ?Sized>(&self, link: &mut L) {
        let topic = event_inbox_topic(&self.event_topic_prefix, &self.device_label);
        if let Err(err) = link.subscribe(&topic) {
            warn!("event inbox subscribe failed: {err}");
        }
    }
}
