use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_label: String,
    pub debounce_ms: u64,
    pub sample_interval_ms: u64,
    pub display_refresh_ms: u64,
    pub milestone_every: u32,
    pub sensor_max: u16,
    pub default_threshold: u16,
    pub button_active_low: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_label: "light-node".to_string(),
            debounce_ms: 30,
            sample_interval_ms: 10,
            display_refresh_ms: 50,
            milestone_every: 10,
            sensor_max: 4095,
            default_threshold: 600,
            button_active_low: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub telemetry_host: String,
    pub telemetry_port: u16,
    pub telemetry_tls: bool,
    pub telemetry_token: String,
    pub event_host: String,
    pub event_port: u16,
    pub event_user: String,
    pub event_pass: String,
    pub event_topic_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            telemetry_host: "industrial.api.ubidots.com".to_string(),
            telemetry_port: 1883,
            telemetry_tls: false,
            telemetry_token: String::new(),
            event_host: "192.168.1.100".to_string(),
            event_port: 1883,
            event_user: String::new(),
            event_pass: String::new(),
            event_topic_prefix: "lightnode".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        if self.device_label.trim().is_empty() {
            self.device_label = Self::default().device_label;
        }
        self.debounce_ms = self.debounce_ms.clamp(5, 500);
        self.sample_interval_ms = self.sample_interval_ms.max(1);
        self.display_refresh_ms = self.display_refresh_ms.clamp(10, 5_000);
        self.milestone_every = self.milestone_every.max(1);
        if self.sensor_max == 0 {
            self.sensor_max = Self::default().sensor_max;
        }
        self.default_threshold = self.default_threshold.min(self.sensor_max);
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.telemetry_port == 0 {
            self.telemetry_port = if self.telemetry_tls { 8883 } else { 1883 };
        }
        if self.event_port == 0 {
            self.event_port = 1883;
        }
        let prefix = self.event_topic_prefix.trim_matches('/');
        self.event_topic_prefix = if prefix.is_empty() {
            Self::default().event_topic_prefix
        } else {
            prefix.to_string()
        };
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.device.sanitize();
        self.network.sanitize();
    }
}
