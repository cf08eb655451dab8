pub const FIELD_MODE: &str = "mode";
pub const FIELD_THRESHOLD: &str = "threshold";
pub const FIELD_LED_STATE: &str = "ledstate";
pub const FIELD_BUTTON_CLICKS: &str = "buttonclicks";
pub const FIELD_LIGHT: &str = "light";

/// Fields the telemetry link mirrors back to the device.
pub const SUBSCRIBED_FIELDS: [&str; 3] = [FIELD_MODE, FIELD_THRESHOLD, FIELD_LED_STATE];

pub const TELEMETRY_TOPIC_ROOT: &str = "/v1.6/devices";
pub const EVENT_STATUS_ONLINE: &str = "online";
pub const EVENT_STATUS_OFFLINE: &str = "offline";

pub fn telemetry_publish_topic(device_label: &str) -> String {
    format!("{TELEMETRY_TOPIC_ROOT}/{device_label}")
}

pub fn telemetry_field_topic(device_label: &str, field: &str) -> String {
    format!("{TELEMETRY_TOPIC_ROOT}/{device_label}/{field}/lv")
}

/// Inverse of [`telemetry_field_topic`].
pub fn field_from_telemetry_topic<'a>(device_label: &str, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(TELEMETRY_TOPIC_ROOT)?
        .strip_prefix('/')?
        .strip_prefix(device_label)?
        .strip_prefix('/')?
        .strip_suffix("/lv")
}

pub fn event_milestone_topic(prefix: &str, device_label: &str) -> String {
    format!("{prefix}/{device_label}/milestone")
}

pub fn event_status_topic(prefix: &str, device_label: &str) -> String {
    format!("{prefix}/{device_label}/status")
}

pub fn event_inbox_topic(prefix: &str, device_label: &str) -> String {
    format!("{prefix}/{device_label}/inbox")
}
