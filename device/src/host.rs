use std::{
    f64::consts::TAU,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::{mpsc, watch, Notify},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use lightnode_common::{
    event_status_topic, field_from_telemetry_topic, telemetry_field_topic, telemetry_publish_topic,
    BridgeStats, ButtonInput, DeviceRuntime, DisplaySnapshot, EventLink, InboundMessage,
    LedOutput, LightSensor, Link, LinkError, PresentationSink, RemoteCommand, RuntimeConfig,
    TelemetryLink, EVENT_STATUS_OFFLINE,
};

const TICK_MS: u64 = 5;
const SIMULATED_PRESS_MS: u64 = 80;
const LIGHT_PERIOD_MS: u64 = 20_000;

#[derive(Clone)]
struct AppState {
    display: watch::Receiver<Option<DisplaySnapshot>>,
    stats: watch::Receiver<BridgeStats>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    display: DisplaySnapshot,
    stats: BridgeStats,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config);
        config.sanitize();
        config
    });
    info!(
        "device {} (telemetry {}:{}, events {}:{})",
        config.device.device_label,
        config.network.telemetry_host,
        config.network.telemetry_port,
        config.network.event_host,
        config.network.event_port
    );

    let telemetry = MqttTelemetryLink::start(&config);
    let events = MqttEventLink::start(&config);
    let board = SimulatedBoard::start(config.device.sensor_max);

    let (display_tx, display_rx) = watch::channel(None);
    let (stats_tx, stats_rx) = watch::channel(BridgeStats::default());
    let display = WatchDisplay { tx: display_tx };

    let mut runtime = DeviceRuntime::new(&config, board, telemetry, events, display)
        .with_wall_clock(|| Some(Utc::now().timestamp_millis()));

    spawn_http_server(AppState {
        display: display_rx,
        stats: stats_rx,
    })
    .await?;

    info!("press <enter> to click the simulated button");

    let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                runtime.tick(monotonic_ms());
                let stats = runtime.stats();
                stats_tx.send_if_modified(|current| {
                    if *current == stats {
                        return false;
                    }
                    *current = stats;
                    true
                });
            }
            _ = &mut shutdown => {
                info!("shutting down after {} clicks", runtime.engine().button_clicks());
                break;
            }
        }
    }

    Ok(())
}

async fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let path = std::env::var("LIGHTNODE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./lightnode.json"));

    let mut config = match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid config at {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => RuntimeConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };

    apply_env_overrides(&mut config);
    config.sanitize();
    Ok(config)
}

fn apply_env_overrides(config: &mut RuntimeConfig) {
    let network = &mut config.network;
    if let Ok(host) = std::env::var("TELEMETRY_HOST") {
        network.telemetry_host = host;
    }
    if let Some(port) = env_port("TELEMETRY_PORT") {
        network.telemetry_port = port;
    }
    if let Ok(token) = std::env::var("UBIDOTS_TOKEN") {
        network.telemetry_token = token;
    }
    if let Ok(host) = std::env::var("EVENT_HOST") {
        network.event_host = host;
    }
    if let Some(port) = env_port("EVENT_PORT") {
        network.event_port = port;
    }
    if let Ok(user) = std::env::var("EVENT_USER") {
        network.event_user = user;
    }
    if let Ok(pass) = std::env::var("EVENT_PASS") {
        network.event_pass = pass;
    }
    if let Ok(label) = std::env::var("DEVICE_LABEL") {
        config.device.device_label = label;
    }
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
}

async fn spawn_http_server(state: AppState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/stats", get(handle_get_stats))
        .with_state(state);

    let port = env_port("LIGHTNODE_HTTP_PORT").unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("status server listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("status server stopped: {err}");
        }
    });
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let display = *state.display.borrow();
    match display {
        Some(display) => Json(StatusBody {
            display,
            stats: *state.stats.borrow(),
        })
        .into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "no frame rendered yet"),
    }
}

async fn handle_get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = *state.stats.borrow();
    Json(stats)
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Connection state shared between a link adapter and its event-loop task.
#[derive(Clone, Default)]
struct ConnectionState {
    connected: Arc<AtomicBool>,
    reconnect: Arc<Notify>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl ConnectionState {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Wakes a stalled event loop and reports the error from its last attempt.
    fn nudge(&self) -> Result<(), LinkError> {
        self.reconnect.notify_one();
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        match last_error {
            Some(reason) => Err(LinkError::Connect(reason)),
            None => Ok(()),
        }
    }

    fn record_error(&self, reason: String) {
        self.connected.store(false, Ordering::Relaxed);
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(reason);
        }
    }
}

fn spawn_connection_loop<F>(
    name: &'static str,
    mut eventloop: EventLoop,
    state: ConnectionState,
    mut on_publish: F,
) where
    F: FnMut(Publish) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    debug!("{name} broker acknowledged connection");
                    state.connected.store(true, Ordering::Relaxed);
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => on_publish(message),
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    state.record_error("broker sent disconnect".to_string());
                }
                Ok(_) => {}
                Err(err) => {
                    state.record_error(err.to_string());
                    // The supervisor nudges on every tick while the link is down.
                    state.reconnect.notified().await;
                }
            }
        }
    });
}

struct MqttTelemetryLink {
    client: AsyncClient,
    device_label: String,
    state: ConnectionState,
    inbound: mpsc::UnboundedReceiver<RemoteCommand>,
}

impl MqttTelemetryLink {
    fn start(config: &RuntimeConfig) -> Self {
        let network = &config.network;
        if network.telemetry_tls {
            warn!("telemetry TLS is only available on the device; using plain MQTT");
        }

        let device_label = config.device.device_label.clone();
        let mut options = MqttOptions::new(
            format!("{device_label}-telemetry"),
            network.telemetry_host.clone(),
            network.telemetry_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if !network.telemetry_token.is_empty() {
            options.set_credentials(network.telemetry_token.clone(), "");
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let state = ConnectionState::default();
        let (tx, inbound) = mpsc::unbounded_channel();

        let label = device_label.clone();
        spawn_connection_loop(
            "telemetry",
            eventloop,
            state.clone(),
            move |message| {
                let Some(field) = field_from_telemetry_topic(&label, &message.topic) else {
                    debug!("ignoring telemetry message on {}", message.topic);
                    return;
                };
                match RemoteCommand::decode_payload(field, &message.payload) {
                    Ok(Some(command)) => {
                        let _ = tx.send(command);
                    }
                    Ok(None) => debug!("ignoring update for unknown field {field}"),
                    Err(err) => warn!("bad {field} update: {err}"),
                }
            },
        );

        Self {
            client,
            device_label,
            state,
            inbound,
        }
    }
}

impl Link for MqttTelemetryLink {
    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.state.nudge()
    }
}

impl TelemetryLink for MqttTelemetryLink {
    fn publish(
        &mut self,
        device_label: &str,
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), LinkError> {
        let body =
            serde_json::to_vec(payload).map_err(|err| LinkError::Publish(err.to_string()))?;
        self.client
            .try_publish(
                telemetry_publish_topic(device_label),
                QoS::AtMostOnce,
                false,
                body,
            )
            .map_err(|err| LinkError::Publish(err.to_string()))
    }

    fn subscribe(&mut self, field: &str) -> Result<(), LinkError> {
        self.client
            .try_subscribe(
                telemetry_field_topic(&self.device_label, field),
                QoS::AtMostOnce,
            )
            .map_err(|err| LinkError::Subscribe {
                field: field.to_string(),
                reason: err.to_string(),
            })
    }

    fn take_commands(&mut self) -> Vec<RemoteCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.inbound.try_recv() {
            commands.push(command);
        }
        commands
    }
}

struct MqttEventLink {
    client: AsyncClient,
    state: ConnectionState,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

impl MqttEventLink {
    fn start(config: &RuntimeConfig) -> Self {
        let network = &config.network;
        let device_label = &config.device.device_label;

        let mut options = MqttOptions::new(
            format!("{device_label}-events"),
            network.event_host.clone(),
            network.event_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            event_status_topic(&network.event_topic_prefix, device_label),
            EVENT_STATUS_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if !network.event_user.is_empty() {
            options.set_credentials(network.event_user.clone(), network.event_pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let state = ConnectionState::default();
        let (tx, inbound) = mpsc::unbounded_channel();

        spawn_connection_loop("event", eventloop, state.clone(), move |message| {
            let _ = tx.send(InboundMessage {
                topic: message.topic,
                payload: message.payload.to_vec(),
            });
        });

        Self {
            client,
            state,
            inbound,
        }
    }
}

impl Link for MqttEventLink {
    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.state.nudge()
    }
}

impl EventLink for MqttEventLink {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|err| LinkError::Publish(err.to_string()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| LinkError::Subscribe {
                field: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn take_messages(&mut self) -> Vec<InboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.inbound.try_recv() {
            messages.push(message);
        }
        messages
    }
}

/// Host stand-in for the real board. Each line on stdin is one button click;
/// the light level follows a slow sine wave across the sensor range.
struct SimulatedBoard {
    clicks: mpsc::UnboundedReceiver<()>,
    pressed_until_ms: u64,
    sensor_max: u16,
    led_on: Option<bool>,
}

impl SimulatedBoard {
    fn start(sensor_max: u16) -> Self {
        let (tx, clicks) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                if tx.send(()).is_err() {
                    break;
                }
            }
        });

        Self {
            clicks,
            pressed_until_ms: 0,
            sensor_max,
            led_on: None,
        }
    }
}

impl ButtonInput for SimulatedBoard {
    fn read_level(&mut self) -> bool {
        let now_ms = monotonic_ms();
        if now_ms >= self.pressed_until_ms && self.clicks.try_recv().is_ok() {
            self.pressed_until_ms = now_ms + SIMULATED_PRESS_MS;
        }
        // Active low: the pin reads high while released.
        now_ms >= self.pressed_until_ms
    }
}

impl LightSensor for SimulatedBoard {
    fn read_analog(&mut self) -> Option<u16> {
        let phase = (monotonic_ms() % LIGHT_PERIOD_MS) as f64 / LIGHT_PERIOD_MS as f64;
        let half = f64::from(self.sensor_max) / 2.0;
        Some((half + half * (phase * TAU).sin()).round() as u16)
    }
}

impl LedOutput for SimulatedBoard {
    fn write_led(&mut self, on: bool) {
        if self.led_on != Some(on) {
            info!("LED {}", if on { "on" } else { "off" });
            self.led_on = Some(on);
        }
    }
}

struct WatchDisplay {
    tx: watch::Sender<Option<DisplaySnapshot>>,
}

impl PresentationSink for WatchDisplay {
    fn render(&mut self, snapshot: &DisplaySnapshot) {
        self.tx.send_replace(Some(*snapshot));
    }
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
