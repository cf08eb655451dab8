use log::{debug, info};

use crate::{
    config::DeviceConfig,
    debounce::Edge,
    led::LedController,
    sampler::SensorReading,
    sync::{EventSource, Field, MilestoneEvent, OutboundEvent, RemoteCommand},
    types::{DisplaySnapshot, LedMode, LinkStatus, StateSnapshot},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    WriteLed(bool),
    Publish(OutboundEvent),
    Milestone(MilestoneEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceState {
    mode: LedMode,
    threshold: u16,
    button_clicks: u32,
    light: Option<u16>,
}

/// Owner of the reconciled device state. Button edges, sensor samples and
/// remote commands all funnel through here; the caller executes the returned
/// actions.
#[derive(Debug, Clone)]
pub struct DeviceEngine {
    pub config: DeviceConfig,
    state: DeviceState,
    led: LedController,
}

impl DeviceEngine {
    pub fn new(mut config: DeviceConfig) -> Self {
        config.sanitize();
        let state = DeviceState {
            mode: LedMode::Off,
            threshold: config.default_threshold,
            button_clicks: 0,
            light: None,
        };
        Self {
            config,
            state,
            led: LedController::new(),
        }
    }

    pub fn mode(&self) -> LedMode {
        self.state.mode
    }

    pub fn led_on(&self) -> bool {
        self.led.is_on()
    }

    pub fn threshold(&self) -> u16 {
        self.state.threshold
    }

    pub fn button_clicks(&self) -> u32 {
        self.state.button_clicks
    }

    pub fn light(&self) -> Option<u16> {
        self.state.light
    }

    pub fn on_button_edge(&mut self, edge: Edge) -> Vec<DeviceAction> {
        if edge == Edge::Released {
            return Vec::new();
        }

        let Some(clicks) = self.state.button_clicks.checked_add(1) else {
            return Vec::new();
        };
        self.state.button_clicks = clicks;
        self.state.mode = self.state.mode.next();
        let led_on = self.reapply_led();
        info!(
            "button press #{clicks}: mode {} led {}",
            self.state.mode.as_str(),
            if led_on { "on" } else { "off" }
        );

        let mut actions = vec![
            DeviceAction::WriteLed(led_on),
            DeviceAction::Publish(self.event(
                EventSource::ButtonClick,
                vec![Field::Mode, Field::LedState, Field::ButtonClicks],
            )),
        ];
        if clicks % self.config.milestone_every == 0 {
            actions.push(DeviceAction::Milestone(MilestoneEvent {
                clicks,
                snapshot: self.snapshot(),
            }));
        }
        actions
    }

    pub fn on_sample(&mut self, reading: SensorReading) -> Vec<DeviceAction> {
        let SensorReading::Value(value) = reading else {
            return Vec::new();
        };
        self.state.light = Some(value);

        if self.state.mode != LedMode::SensorDriven {
            return Vec::new();
        }

        let previous = self.led.is_on();
        let led_on = self.reapply_led();
        if led_on == previous {
            return Vec::new();
        }

        debug!(
            "light {value} vs threshold {}: led {}",
            self.state.threshold,
            if led_on { "on" } else { "off" }
        );
        vec![
            DeviceAction::WriteLed(led_on),
            DeviceAction::Publish(self.event(
                EventSource::LedChangedBySensor,
                vec![Field::LedState, Field::Light],
            )),
        ]
    }

    /// Applies a remote mirror update. Values equal to the current state are
    /// dropped so the mirror never echoes back into a local mutation.
    /// Remote-originated changes produce hardware writes only, never
    /// outbound events.
    pub fn apply_remote(&mut self, command: RemoteCommand) -> Vec<DeviceAction> {
        match command {
            RemoteCommand::Mode(mode) => {
                if mode == self.state.mode {
                    debug!("remote mode {} matches; ignoring", mode.as_str());
                    return Vec::new();
                }
                self.state.mode = mode;
                let led_on = self.reapply_led();
                info!("remote set mode {}", mode.as_str());
                vec![DeviceAction::WriteLed(led_on)]
            }
            RemoteCommand::Threshold(raw) => {
                let threshold = raw.min(self.config.sensor_max);
                if threshold == self.state.threshold {
                    debug!("remote threshold {threshold} matches; ignoring");
                    return Vec::new();
                }
                self.state.threshold = threshold;
                info!("remote set threshold {threshold}");

                if self.state.mode != LedMode::SensorDriven {
                    return Vec::new();
                }
                let previous = self.led.is_on();
                let led_on = self.reapply_led();
                if led_on == previous {
                    Vec::new()
                } else {
                    vec![DeviceAction::WriteLed(led_on)]
                }
            }
            RemoteCommand::LedState(on) => {
                if !self.led.force(on) {
                    debug!("remote ledstate matches; ignoring");
                    return Vec::new();
                }
                info!("remote forced led {}", if on { "on" } else { "off" });
                vec![DeviceAction::WriteLed(on)]
            }
        }
    }

    /// Full-state publish used after the telemetry link (re)connects.
    pub fn resync(&self) -> DeviceAction {
        DeviceAction::Publish(self.event(EventSource::Resync, Field::ALL.to_vec()))
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            mode: self.state.mode,
            led_on: self.led.is_on(),
            threshold: self.state.threshold,
            button_clicks: self.state.button_clicks,
            light: self.state.light,
        }
    }

    pub fn display_snapshot(&self, telemetry: LinkStatus, events: LinkStatus) -> DisplaySnapshot {
        DisplaySnapshot {
            light: self.state.light,
            mode: self.state.mode.as_str(),
            led_on: self.led.is_on(),
            button_clicks: self.state.button_clicks,
            telemetry_link: telemetry.as_str(),
            event_link: events.as_str(),
        }
    }

    fn reapply_led(&mut self) -> bool {
        self.led
            .apply_mode(self.state.mode, self.state.light, self.state.threshold)
    }

    fn event(&self, source: EventSource, changed: Vec<Field>) -> OutboundEvent {
        OutboundEvent {
            source,
            changed,
            snapshot: self.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn engine() -> DeviceEngine {
        DeviceEngine::new(DeviceConfig::default())
    }

    fn press(engine: &mut DeviceEngine) -> Vec<DeviceAction> {
        let actions = engine.on_button_edge(Edge::Pressed);
        assert!(engine.on_button_edge(Edge::Released).is_empty());
        actions
    }

    fn sensor_driven(engine: &mut DeviceEngine) {
        let _ = engine.apply_remote(RemoteCommand::Mode(LedMode::SensorDriven));
    }

    #[test]
    fn press_from_off_turns_led_on_and_publishes() {
        let mut engine = engine();

        let actions = press(&mut engine);

        assert_eq!(engine.mode(), LedMode::On);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], DeviceAction::WriteLed(true));
        match &actions[1] {
            DeviceAction::Publish(event) => {
                assert_eq!(event.source, EventSource::ButtonClick);
                assert_eq!(event.snapshot.mode.index(), 1);
                assert_eq!(event.snapshot.button_clicks, 1);
                assert!(event.snapshot.led_on);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn mode_follows_press_count_mod_three() {
        let mut engine = engine();
        for n in 1..=31u32 {
            let _ = press(&mut engine);
            assert_eq!(u32::from(engine.mode().index()), n % 3, "after {n} presses");
        }
    }

    #[test]
    fn milestone_fires_every_tenth_click_only() {
        let mut engine = engine();
        let mut milestones = Vec::new();

        for _ in 0..35 {
            for action in press(&mut engine) {
                if let DeviceAction::Milestone(event) = action {
                    milestones.push(event.clicks);
                }
            }
        }

        assert_eq!(milestones, vec![10, 20, 30]);
    }

    #[test]
    fn sensor_flip_publishes_once() {
        let mut engine = engine();
        sensor_driven(&mut engine);

        let first = engine.on_sample(SensorReading::Value(450));
        assert_eq!(first[0], DeviceAction::WriteLed(true));
        assert!(engine.on_sample(SensorReading::Value(455)).is_empty());

        let flip = engine.on_sample(SensorReading::Value(650));
        assert_eq!(flip.len(), 2);
        assert_eq!(flip[0], DeviceAction::WriteLed(false));
        match &flip[1] {
            DeviceAction::Publish(event) => {
                assert_eq!(event.source, EventSource::LedChangedBySensor);
                assert_eq!(event.changed, vec![Field::LedState, Field::Light]);
                assert_eq!(event.snapshot.light, Some(650));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn unavailable_sample_keeps_led() {
        let mut engine = engine();
        sensor_driven(&mut engine);
        let _ = engine.on_sample(SensorReading::Value(100));

        assert!(engine.on_sample(SensorReading::Unavailable).is_empty());
        assert!(engine.led_on());
        assert_eq!(engine.light(), Some(100));
    }

    #[test]
    fn samples_outside_sensor_mode_only_update_light() {
        let mut engine = engine();

        assert!(engine.on_sample(SensorReading::Value(10)).is_empty());
        assert!(!engine.led_on());
        assert_eq!(engine.light(), Some(10));
    }

    #[test]
    fn equal_remote_values_produce_no_actions() {
        let mut engine = engine();

        assert!(engine.apply_remote(RemoteCommand::Mode(LedMode::Off)).is_empty());
        assert!(engine.apply_remote(RemoteCommand::Threshold(600)).is_empty());
        assert!(engine.apply_remote(RemoteCommand::LedState(false)).is_empty());
        assert_eq!(engine.snapshot(), DeviceEngine::new(DeviceConfig::default()).snapshot());
    }

    #[test]
    fn remote_mode_rederives_from_cached_light() {
        let mut engine = engine();
        let _ = engine.on_sample(SensorReading::Value(200));

        let actions = engine.apply_remote(RemoteCommand::Mode(LedMode::SensorDriven));

        assert_eq!(actions, vec![DeviceAction::WriteLed(true)]);
        assert_eq!(engine.button_clicks(), 0);
    }

    #[test]
    fn remote_threshold_is_clamped_and_may_flip_led() {
        let mut engine = engine();
        sensor_driven(&mut engine);
        let _ = engine.on_sample(SensorReading::Value(3000));
        assert!(!engine.led_on());

        let actions = engine.apply_remote(RemoteCommand::Threshold(u16::MAX));

        assert_eq!(engine.threshold(), 4095);
        assert_eq!(actions, vec![DeviceAction::WriteLed(true)]);
        assert!(engine.apply_remote(RemoteCommand::Threshold(5000)).is_empty());
    }

    #[test]
    fn remote_threshold_outside_sensor_mode_does_not_touch_led() {
        let mut engine = engine();
        let _ = press(&mut engine);

        assert!(engine.apply_remote(RemoteCommand::Threshold(100)).is_empty());
        assert_eq!(engine.threshold(), 100);
        assert!(engine.led_on());
    }

    #[test]
    fn remote_led_override_writes_directly() {
        let mut engine = engine();

        assert_eq!(
            engine.apply_remote(RemoteCommand::LedState(true)),
            vec![DeviceAction::WriteLed(true)]
        );
        assert_eq!(engine.mode(), LedMode::Off);
        assert!(engine.led_on());
    }

    #[test]
    fn resync_carries_every_field() {
        let engine = engine();

        match engine.resync() {
            DeviceAction::Publish(event) => {
                assert_eq!(event.source, EventSource::Resync);
                assert_eq!(event.changed, Field::ALL.to_vec());
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn display_snapshot_reflects_links() {
        let engine = engine();

        let display = engine.display_snapshot(LinkStatus::Connected, LinkStatus::Connecting);

        assert_eq!(display.mode, "OFF");
        assert_eq!(display.light, None);
        assert_eq!(display.telemetry_link, "CONNECTED");
        assert_eq!(display.event_link, "CONNECTING");
    }
}
