use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{Datelike, Utc};
use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{Gpio0, Gpio2, Gpio34, Input, Output, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};
use ssd1306::{mode::BufferedGraphicsMode, prelude::*, I2CDisplayInterface, Ssd1306};

use lightnode_common::{
    config::NetworkConfig, event_status_topic, field_from_telemetry_topic, telemetry_field_topic,
    telemetry_publish_topic, ButtonInput, DeviceError, DeviceRuntime, DisplaySnapshot, EventLink,
    InboundMessage, LedOutput, LightSensor, Link, LinkError, PresentationSink, RemoteCommand,
    RuntimeConfig, TelemetryLink, EVENT_STATUS_OFFLINE, MAX_REMOTE_PAYLOAD_BYTES,
};

const NVS_NAMESPACE: &str = "lightnode";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const TICK_MS: u64 = 5;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const I2C_FREQ_HZ: u32 = 400_000;
const MIN_SYNCED_YEAR: i32 = 2024;

type OledDisplay = Ssd1306<
    I2CInterface<I2cDriver<'static>>,
    DisplaySize128x64,
    BufferedGraphicsMode<DisplaySize128x64>,
>;
type SharedClient = Arc<Mutex<EspMqttClient<'static>>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    apply_build_defaults(&mut config.network);
    config.sanitize();

    info!(
        "config loaded: device=`{}`, ssid=`{}`, telemetry=`{}:{}`, events=`{}:{}`",
        config.device.device_label,
        config.network.wifi_ssid,
        config.network.telemetry_host,
        config.network.telemetry_port,
        config.network.event_host,
        config.network.event_port,
    );

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let i2c = I2cDriver::new(
        peripherals.i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(Hertz(I2C_FREQ_HZ)),
    )
    .context("failed to create I2C driver")?;
    let display = match OledSink::new(i2c) {
        Ok(display) => display,
        Err(err) => halt(err),
    };

    let board = EspBoard::new(pins.gpio0, pins.gpio2, peripherals.adc1, pins.gpio34)?;

    let wifi = connect_wifi(peripherals.modem, sys_loop, nvs_partition, &config.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let telemetry = EspTelemetryLink::start(&config)?;
    let events = EspEventLink::start(&config)?;

    let mut runtime = DeviceRuntime::new(&config, board, telemetry, events, display)
        .with_wall_clock(synced_epoch_ms);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    // Keep wifi alive for the program lifetime.
    let _wifi = wifi;

    loop {
        runtime.tick(monotonic_ms());
        feed_watchdog();
        thread::sleep(Duration::from_millis(TICK_MS));
    }
}

/// No recovery path without a physical reset.
fn halt(err: DeviceError) -> ! {
    error!("{err}; halting");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn apply_build_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("LIGHTNODE_WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }
    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("LIGHTNODE_WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
    if network.telemetry_token.is_empty() {
        if let Some(token) = option_env!("UBIDOTS_TOKEN") {
            network.telemetry_token = token.to_string();
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    // Later drops are handled by the telemetry link's reconnect nudge.
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }

    Ok(esp_wifi)
}

struct EspBoard {
    button: PinDriver<'static, Gpio0, Input>,
    led: PinDriver<'static, Gpio2, Output>,
    light: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl EspBoard {
    fn new(button: Gpio0, led: Gpio2, adc: ADC1, light: Gpio34) -> anyhow::Result<Self> {
        let mut button = PinDriver::input(button).context("button pin")?;
        button.set_pull(Pull::Up).context("button pull-up")?;

        let mut led = PinDriver::output(led).context("LED pin")?;
        let _ = led.set_low();

        let adc = AdcDriver::new(adc).context("ADC driver")?;
        let channel_config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let light = AdcChannelDriver::new(adc, light, &channel_config).context("light sensor")?;

        Ok(Self { button, led, light })
    }
}

impl ButtonInput for EspBoard {
    fn read_level(&mut self) -> bool {
        self.button.is_high()
    }
}

impl LightSensor for EspBoard {
    fn read_analog(&mut self) -> Option<u16> {
        self.light.read_raw().ok()
    }
}

impl LedOutput for EspBoard {
    fn write_led(&mut self, on: bool) {
        let _ = if on {
            self.led.set_high()
        } else {
            self.led.set_low()
        };
    }
}

struct OledSink {
    display: OledDisplay,
    last: Option<DisplaySnapshot>,
}

impl OledSink {
    fn new(i2c: I2cDriver<'static>) -> Result<Self, DeviceError> {
        let interface = I2CDisplayInterface::new(i2c);
        let mut display = Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate0)
            .into_buffered_graphics_mode();
        display.init().map_err(|err| DeviceError::HardwareInit {
            component: "SSD1306 display",
            reason: format!("{err:?}"),
        })?;
        display.clear_buffer();
        let _ = display.flush();

        Ok(Self {
            display,
            last: None,
        })
    }
}

impl PresentationSink for OledSink {
    fn render(&mut self, snapshot: &DisplaySnapshot) {
        if self.last.as_ref() == Some(snapshot) {
            return;
        }
        self.last = Some(*snapshot);

        let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
        let light = snapshot
            .light
            .map_or_else(|| "--".to_string(), |value| value.to_string());
        let lines = [
            format!("Light: {light}"),
            format!("Mode:  {}", snapshot.mode),
            format!("LED:   {}", if snapshot.led_on { "ON" } else { "OFF" }),
            format!("Clicks: {}", snapshot.button_clicks),
            format!(
                "A:{} B:{}",
                link_glyph(snapshot.telemetry_link),
                link_glyph(snapshot.event_link)
            ),
        ];

        self.display.clear_buffer();
        for (row, line) in lines.iter().enumerate() {
            let _ = Text::with_baseline(line, Point::new(0, row as i32 * 12), style, Baseline::Top)
                .draw(&mut self.display);
        }
        if let Err(err) = self.display.flush() {
            debug!("display flush failed: {err:?}");
        }
    }
}

fn link_glyph(status: &str) -> &'static str {
    match status {
        "CONNECTED" => "up",
        "CONNECTING" => "..",
        _ => "down",
    }
}

fn create_mqtt_client(
    url: &str,
    client_id: &str,
    username: &str,
    password: &str,
    lwt: Option<LwtConfiguration<'_>>,
    tls: bool,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let conf = MqttClientConfiguration {
        client_id: Some(client_id),
        username: (!username.is_empty()).then_some(username),
        password: (!password.is_empty()).then_some(password),
        lwt,
        crt_bundle_attach: if tls {
            Some(esp_idf_svc::sys::esp_crt_bundle_attach)
        } else {
            None
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url, &conf)?)
}

/// Drains one esp-mqtt connection on its own thread, forwarding complete
/// publishes and tracking the connected flag. Must not call back into the
/// client: esp-mqtt holds its API lock while an event is borrowed.
fn spawn_mqtt_receiver<F>(
    name: &'static str,
    mut conn: EspMqttConnection,
    connected: Arc<AtomicBool>,
    mut on_message: F,
) -> anyhow::Result<()>
where
    F: FnMut(&str, &[u8]) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{name}-rx"))
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        connected.store(true, Ordering::Relaxed);
                    }
                    EventPayload::Disconnected => {
                        connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_REMOTE_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized {name} payload on {topic} ({} bytes)",
                                data.len()
                            );
                            continue;
                        }
                        on_message(topic, data);
                    }
                    _ => {}
                },
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("{name} receive loop ended: {err:?}");
                    break;
                }
            }
        })
        .with_context(|| format!("failed to spawn {name} receiver thread"))?;
    Ok(())
}

struct EspTelemetryLink {
    client: SharedClient,
    device_label: String,
    connected: Arc<AtomicBool>,
    inbound: mpsc::Receiver<RemoteCommand>,
}

impl EspTelemetryLink {
    fn start(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let network = &config.network;
        let scheme = if network.telemetry_tls { "mqtts" } else { "mqtt" };
        let url = format!("{scheme}://{}:{}", network.telemetry_host, network.telemetry_port);
        let device_label = config.device.device_label.clone();

        let (client, conn) = create_mqtt_client(
            &url,
            &format!("{device_label}-telemetry"),
            &network.telemetry_token,
            "",
            None,
            network.telemetry_tls,
        )?;

        let connected = Arc::new(AtomicBool::new(false));
        let (tx, inbound) = mpsc::channel();
        let label = device_label.clone();
        spawn_mqtt_receiver(
            "telemetry",
            conn,
            connected.clone(),
            move |topic, data| {
                let Some(field) = field_from_telemetry_topic(&label, topic) else {
                    return;
                };
                match RemoteCommand::decode_payload(field, data) {
                    Ok(Some(command)) => {
                        let _ = tx.send(command);
                    }
                    Ok(None) => debug!("ignoring update for unknown field {field}"),
                    Err(err) => warn!("bad {field} update: {err}"),
                }
            },
        )?;

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            device_label,
            connected,
            inbound,
        })
    }
}

impl Link for EspTelemetryLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// esp-mqtt reconnects on its own once the station is associated, so the
    /// only thing to drive here is Wi-Fi.
    fn connect(&mut self) -> Result<(), LinkError> {
        if is_wifi_station_connected() {
            return Ok(());
        }
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
        Err(LinkError::Connect(format!("wifi station down (esp_wifi_connect={rc})")))
    }
}

impl TelemetryLink for EspTelemetryLink {
    fn publish(
        &mut self,
        device_label: &str,
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), LinkError> {
        let body =
            serde_json::to_vec(payload).map_err(|err| LinkError::Publish(err.to_string()))?;
        let mut client = self
            .client
            .lock()
            .map_err(|_| LinkError::Publish("client lock poisoned".to_string()))?;
        client
            .enqueue(
                &telemetry_publish_topic(device_label),
                QoS::AtMostOnce,
                false,
                &body,
            )
            .map(|_| ())
            .map_err(|err| LinkError::Publish(err.to_string()))
    }

    fn subscribe(&mut self, field: &str) -> Result<(), LinkError> {
        let subscribe_error = |reason: String| LinkError::Subscribe {
            field: field.to_string(),
            reason,
        };
        let mut client = self
            .client
            .lock()
            .map_err(|_| subscribe_error("client lock poisoned".to_string()))?;
        client
            .subscribe(
                &telemetry_field_topic(&self.device_label, field),
                QoS::AtMostOnce,
            )
            .map(|_| ())
            .map_err(|err| subscribe_error(err.to_string()))
    }

    fn take_commands(&mut self) -> Vec<RemoteCommand> {
        self.inbound.try_iter().collect()
    }
}

struct EspEventLink {
    client: SharedClient,
    connected: Arc<AtomicBool>,
    inbound: mpsc::Receiver<InboundMessage>,
}

impl EspEventLink {
    fn start(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let network = &config.network;
        let device_label = &config.device.device_label;
        let url = format!("mqtt://{}:{}", network.event_host, network.event_port);
        let status_topic = event_status_topic(&network.event_topic_prefix, device_label);

        let (client, conn) = create_mqtt_client(
            &url,
            &format!("{device_label}-events"),
            &network.event_user,
            &network.event_pass,
            Some(LwtConfiguration {
                topic: &status_topic,
                payload: EVENT_STATUS_OFFLINE.as_bytes(),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            false,
        )?;

        let connected = Arc::new(AtomicBool::new(false));
        let (tx, inbound) = mpsc::channel();
        spawn_mqtt_receiver("event", conn, connected.clone(), move |topic, data| {
            let _ = tx.send(InboundMessage {
                topic: topic.to_string(),
                payload: data.to_vec(),
            });
        })?;

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            connected,
            inbound,
        })
    }
}

impl Link for EspEventLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        if is_wifi_station_connected() {
            Ok(())
        } else {
            Err(LinkError::Connect("wifi station down".to_string()))
        }
    }
}

impl EventLink for EspEventLink {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        let mut client = self
            .client
            .lock()
            .map_err(|_| LinkError::Publish("client lock poisoned".to_string()))?;
        client
            .enqueue(topic, QoS::AtLeastOnce, retain, payload)
            .map(|_| ())
            .map_err(|err| LinkError::Publish(err.to_string()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        let subscribe_error = |reason: String| LinkError::Subscribe {
            field: topic.to_string(),
            reason,
        };
        let mut client = self
            .client
            .lock()
            .map_err(|_| subscribe_error("client lock poisoned".to_string()))?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| subscribe_error(err.to_string()))
    }

    fn take_messages(&mut self) -> Vec<InboundMessage> {
        self.inbound.try_iter().collect()
    }
}

fn synced_epoch_ms() -> Option<i64> {
    let now = Utc::now();
    (now.year() >= MIN_SYNCED_YEAR).then(|| now.timestamp_millis())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
