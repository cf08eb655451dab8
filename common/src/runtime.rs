//! The cooperative tick loop tying board, links and engine together.

use log::{info, warn};

use crate::{
    config::RuntimeConfig,
    debounce::{ActiveLevel, Debouncer},
    engine::{DeviceAction, DeviceEngine},
    link::{EventLink, LinkSupervisor, LinkTransition, TelemetryLink},
    ports::{Board, PresentationSink},
    sampler::SensorSampler,
    sync::{BridgeStats, RemoteSyncBridge, MAX_REMOTE_PAYLOAD_BYTES},
    types::LinkStatus,
};

pub struct DeviceRuntime<B, A, E, P> {
    engine: DeviceEngine,
    debouncer: Debouncer,
    sampler: SensorSampler,
    bridge: RemoteSyncBridge,
    telemetry_supervisor: LinkSupervisor,
    event_supervisor: LinkSupervisor,

    board: B,
    telemetry: A,
    events: E,
    display: P,

    display_refresh_ms: u64,
    last_render_ms: Option<u64>,
    frame_dirty: bool,
    wall_clock: fn() -> Option<i64>,
}

impl<B, A, E, P> DeviceRuntime<B, A, E, P>
where
    B: Board,
    A: TelemetryLink,
    E: EventLink,
    P: PresentationSink,
{
    pub fn new(
        config: &RuntimeConfig,
        mut board: B,
        telemetry: A,
        events: E,
        display: P,
    ) -> Self {
        let engine = DeviceEngine::new(config.device.clone());
        let device = &engine.config;

        board.write_led(engine.led_on());

        Self {
            debouncer: Debouncer::new(
                device.debounce_ms,
                ActiveLevel::from_active_low(device.button_active_low),
            ),
            sampler: SensorSampler::new(device.sample_interval_ms, device.sensor_max),
            bridge: RemoteSyncBridge::new(
                device.device_label.clone(),
                config.network.event_topic_prefix.clone(),
            ),
            telemetry_supervisor: LinkSupervisor::new("telemetry"),
            event_supervisor: LinkSupervisor::new("event"),
            display_refresh_ms: device.display_refresh_ms,
            last_render_ms: None,
            frame_dirty: false,
            wall_clock: || None,
            engine,
            board,
            telemetry,
            events,
            display,
        }
    }

    /// Source of epoch-millisecond timestamps for milestone events. `None`
    /// while the wall clock is not yet known.
    pub fn with_wall_clock(mut self, clock: fn() -> Option<i64>) -> Self {
        self.wall_clock = clock;
        self
    }

    /// One non-blocking pass: links, inbound, button, sensor, presentation.
    pub fn tick(&mut self, now_ms: u64) {
        self.maintain_links();
        self.drain_inbound();

        let level = self.board.read_level();
        if let Some(edge) = self.debouncer.observe(level, now_ms) {
            let actions = self.engine.on_button_edge(edge);
            self.frame_dirty |= !actions.is_empty();
            self.execute(actions);
        }

        if let Some(reading) = self.sampler.maybe_sample(now_ms, &mut self.board) {
            let actions = self.engine.on_sample(reading);
            self.execute(actions);
        }

        // A state change is shown in the tick that caused it; otherwise the
        // display follows its own cadence.
        let render_due = self.frame_dirty
            || self
                .last_render_ms
                .map_or(true, |last| now_ms.saturating_sub(last) >= self.display_refresh_ms);
        if render_due {
            self.last_render_ms = Some(now_ms);
            self.frame_dirty = false;
            let snapshot = self
                .engine
                .display_snapshot(self.telemetry_status(), self.event_status());
            self.display.render(&snapshot);
        }
    }

    pub fn engine(&self) -> &DeviceEngine {
        &self.engine
    }

    pub fn stats(&self) -> BridgeStats {
        self.bridge.stats()
    }

    pub fn telemetry_status(&self) -> LinkStatus {
        self.telemetry_supervisor.status()
    }

    pub fn event_status(&self) -> LinkStatus {
        self.event_supervisor.status()
    }

    pub fn telemetry_supervisor(&self) -> &LinkSupervisor {
        &self.telemetry_supervisor
    }

    pub fn event_supervisor(&self) -> &LinkSupervisor {
        &self.event_supervisor
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn telemetry(&self) -> &A {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut A {
        &mut self.telemetry
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    pub fn display(&self) -> &P {
        &self.display
    }

    fn maintain_links(&mut self) {
        if self.telemetry_supervisor.poll(&mut self.telemetry) == Some(LinkTransition::Up) {
            self.bridge.subscribe_mirror(&mut self.telemetry);
            let resync = self.engine.resync();
            self.execute(vec![resync]);
        }

        if self.event_supervisor.poll(&mut self.events) == Some(LinkTransition::Up) {
            self.bridge.subscribe_inbox(&mut self.events);
            self.bridge.announce_online(&mut self.events);
        }
    }

    fn drain_inbound(&mut self) {
        if self.telemetry_supervisor.is_up() {
            for command in self.telemetry.take_commands() {
                let actions = self.engine.apply_remote(command);
                self.execute(actions);
            }
        }

        if self.event_supervisor.is_up() {
            for message in self.events.take_messages() {
                if message.payload.len() > MAX_REMOTE_PAYLOAD_BYTES {
                    warn!(
                        "dropping {}-byte message on {}",
                        message.payload.len(),
                        message.topic
                    );
                    continue;
                }
                info!(
                    "event message on {}: {}",
                    message.topic,
                    String::from_utf8_lossy(&message.payload)
                );
            }
        }
    }

    fn execute(&mut self, actions: Vec<DeviceAction>) {
        for action in actions {
            match action {
                DeviceAction::WriteLed(on) => {
                    self.board.write_led(on);
                    self.frame_dirty = true;
                }
                DeviceAction::Publish(event) => {
                    let _ = self.bridge.publish_state(&mut self.telemetry, &event);
                }
                DeviceAction::Milestone(event) => {
                    let sent_at = (self.wall_clock)();
                    let _ = self
                        .bridge
                        .publish_milestone(&mut self.events, &event, sent_at);
                }
            }
        }
    }
}
