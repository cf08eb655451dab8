use lightnode_common::{
    ButtonInput, DeviceRuntime, DisplaySnapshot, EventLink, InboundMessage, LedMode, LedOutput,
    LightSensor, Link, LinkError, LinkStatus, PresentationSink, RemoteCommand, RuntimeConfig,
    TelemetryLink, MAX_REMOTE_PAYLOAD_BYTES,
};
use pretty_assertions::assert_eq;
use serde_json::{Map, Value};

struct FakeBoard {
    level: bool,
    light: Option<u16>,
    led_writes: Vec<bool>,
}

impl ButtonInput for FakeBoard {
    fn read_level(&mut self) -> bool {
        self.level
    }
}

impl LightSensor for FakeBoard {
    fn read_analog(&mut self) -> Option<u16> {
        self.light
    }
}

impl LedOutput for FakeBoard {
    fn write_led(&mut self, on: bool) {
        self.led_writes.push(on);
    }
}

#[derive(Default)]
struct FakeTelemetry {
    reachable: bool,
    connected: bool,
    connect_calls: u32,
    published: Vec<Map<String, Value>>,
    subscribed: Vec<String>,
    inbox: Vec<RemoteCommand>,
}

impl Link for FakeTelemetry {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.connect_calls += 1;
        if self.reachable {
            self.connected = true;
            Ok(())
        } else {
            Err(LinkError::Connect("no route to broker".to_string()))
        }
    }
}

impl TelemetryLink for FakeTelemetry {
    fn publish(
        &mut self,
        _device_label: &str,
        payload: &Map<String, Value>,
    ) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.published.push(payload.clone());
        Ok(())
    }

    fn subscribe(&mut self, field: &str) -> Result<(), LinkError> {
        self.subscribed.push(field.to_string());
        Ok(())
    }

    fn take_commands(&mut self) -> Vec<RemoteCommand> {
        std::mem::take(&mut self.inbox)
    }
}

#[derive(Default)]
struct FakeEvents {
    reachable: bool,
    connected: bool,
    published: Vec<(String, Vec<u8>, bool)>,
    subscribed: Vec<String>,
    inbox: Vec<InboundMessage>,
}

impl Link for FakeEvents {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.connected = self.reachable;
        if self.reachable {
            Ok(())
        } else {
            Err(LinkError::Connect("timeout".to_string()))
        }
    }
}

impl EventLink for FakeEvents {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        self.published
            .push((topic.to_string(), payload.to_vec(), retain));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.subscribed.push(topic.to_string());
        Ok(())
    }

    fn take_messages(&mut self) -> Vec<InboundMessage> {
        std::mem::take(&mut self.inbox)
    }
}

#[derive(Default)]
struct RecordingDisplay {
    frames: Vec<DisplaySnapshot>,
}

impl PresentationSink for RecordingDisplay {
    fn render(&mut self, snapshot: &DisplaySnapshot) {
        self.frames.push(*snapshot);
    }
}

type Runtime = DeviceRuntime<FakeBoard, FakeTelemetry, FakeEvents, RecordingDisplay>;

fn runtime(light: Option<u16>) -> Runtime {
    let board = FakeBoard {
        level: true,
        light,
        led_writes: Vec::new(),
    };
    let telemetry = FakeTelemetry {
        reachable: true,
        ..FakeTelemetry::default()
    };
    let events = FakeEvents {
        reachable: true,
        ..FakeEvents::default()
    };
    DeviceRuntime::new(
        &RuntimeConfig::default(),
        board,
        telemetry,
        events,
        RecordingDisplay::default(),
    )
}

/// Holds the button down for one debounce window, then releases it.
/// Returns the time after the release has settled.
fn press(runtime: &mut Runtime, start_ms: u64) -> u64 {
    runtime.board_mut().level = false;
    runtime.tick(start_ms);
    runtime.tick(start_ms + 30);
    runtime.board_mut().level = true;
    runtime.tick(start_ms + 40);
    runtime.tick(start_ms + 70);
    start_ms + 80
}

fn source_of(payload: &Map<String, Value>) -> &str {
    payload["mode"]["context"]["source"].as_str().unwrap_or_default()
}

#[test]
fn scenario_a_single_press_from_off() {
    let mut runtime = runtime(Some(800));
    runtime.tick(0);
    assert_eq!(source_of(&runtime.telemetry().published[0]), "resync");
    runtime.telemetry_mut().published.clear();

    press(&mut runtime, 10);

    assert_eq!(runtime.engine().mode(), LedMode::On);
    assert_eq!(runtime.board().led_writes.last(), Some(&true));
    let published = &runtime.telemetry().published;
    assert_eq!(published.len(), 1);
    assert_eq!(source_of(&published[0]), "button_click");
    assert_eq!(published[0]["mode"]["value"], 1);
    assert_eq!(published[0]["ledstate"]["value"], 1);
    assert_eq!(published[0]["buttonclicks"]["value"], 1);
    assert_eq!(published[0]["threshold"]["context"]["changed"], false);
}

#[test]
fn scenario_b_sensor_driven_flip() {
    let mut runtime = runtime(Some(450));
    runtime
        .telemetry_mut()
        .inbox
        .push(RemoteCommand::Mode(LedMode::SensorDriven));

    runtime.tick(0);
    assert!(runtime.engine().led_on());
    assert_eq!(runtime.board().led_writes.last(), Some(&true));
    runtime.telemetry_mut().published.clear();

    runtime.board_mut().light = Some(650);
    runtime.tick(10);

    assert!(!runtime.engine().led_on());
    assert_eq!(runtime.board().led_writes.last(), Some(&false));
    let published = &runtime.telemetry().published;
    assert_eq!(published.len(), 1);
    assert_eq!(source_of(&published[0]), "led_changed_by_sensor");
    assert_eq!(published[0]["light"]["value"], 650);
    assert_eq!(published[0]["light"]["context"]["changed"], true);
}

#[test]
fn scenario_c_equal_threshold_is_suppressed() {
    let mut runtime = runtime(Some(800));
    runtime.tick(0);
    let published_before = runtime.telemetry().published.len();
    let writes_before = runtime.board().led_writes.len();

    runtime
        .telemetry_mut()
        .inbox
        .push(RemoteCommand::Threshold(600));
    runtime.tick(10);

    assert_eq!(runtime.engine().threshold(), 600);
    assert_eq!(runtime.telemetry().published.len(), published_before);
    assert_eq!(runtime.board().led_writes.len(), writes_before);
}

#[test]
fn scenario_d_outage_then_resync_without_backlog() {
    let mut runtime = runtime(Some(800));
    runtime.tick(0);
    let mut now = press(&mut runtime, 10);
    now = press(&mut runtime, now);
    let published_before = runtime.telemetry().published.len();

    {
        let telemetry = runtime.telemetry_mut();
        telemetry.reachable = false;
        telemetry.connected = false;
    }
    runtime.tick(now);
    assert_eq!(runtime.telemetry_status(), LinkStatus::Disconnected);
    let calls_at_outage = runtime.telemetry().connect_calls;

    for n in 3..=17u32 {
        now = press(&mut runtime, now + 10);
        assert_eq!(u32::from(runtime.engine().mode().index()), n % 3);
        assert_eq!(runtime.engine().led_on(), runtime.engine().mode() == LedMode::On);
    }

    assert_eq!(runtime.engine().button_clicks(), 17);
    assert_eq!(runtime.telemetry().published.len(), published_before);
    assert_eq!(runtime.stats().telemetry.dropped, 15);
    assert_eq!(runtime.telemetry().connect_calls - calls_at_outage, 60);

    runtime.telemetry_mut().reachable = true;
    runtime.tick(now + 10);

    assert_eq!(runtime.telemetry_status(), LinkStatus::Connected);
    let published = &runtime.telemetry().published;
    assert_eq!(published.len(), published_before + 1);
    let resync = &published[published_before];
    assert_eq!(source_of(resync), "resync");
    assert_eq!(resync["buttonclicks"]["value"], 17);
    assert_eq!(resync["mode"]["value"], 2);
    assert_eq!(resync["light"]["value"], 800);
}

#[test]
fn milestone_goes_to_event_link() {
    let mut runtime = runtime(None);
    runtime.tick(0);

    let mut now = 10;
    for _ in 0..10 {
        now = press(&mut runtime, now);
    }

    let published = &runtime.events().published;
    assert_eq!(published[0].0, "lightnode/light-node/status");
    assert_eq!(published[0].1, b"online".to_vec());
    assert!(published[0].2);

    let milestones: Vec<&(String, Vec<u8>, bool)> = published
        .iter()
        .filter(|(topic, _, _)| topic.ends_with("/milestone"))
        .collect();
    assert_eq!(milestones.len(), 1);
    let body: Value = serde_json::from_slice(&milestones[0].1).unwrap();
    assert_eq!(body["clicks"], 10);
    assert_eq!(body["device"], "light-node");
    assert!(body.get("sentAt").is_none());
    assert_eq!(runtime.stats().events.delivered, 1);
}

#[test]
fn links_are_supervised_independently() {
    let mut runtime = runtime(None);
    runtime.events_mut().reachable = false;

    for now in (0..100).step_by(10) {
        runtime.tick(now);
    }

    assert_eq!(runtime.telemetry_status(), LinkStatus::Connected);
    assert_eq!(runtime.event_status(), LinkStatus::Disconnected);
    assert_eq!(runtime.event_supervisor().attempts(), 10);
    assert_eq!(
        runtime.telemetry().subscribed,
        vec!["mode", "threshold", "ledstate"]
    );
}

#[test]
fn inbound_is_paused_while_link_is_down() {
    let mut runtime = runtime(None);
    runtime.telemetry_mut().reachable = false;
    runtime.events_mut().reachable = false;
    runtime
        .telemetry_mut()
        .inbox
        .push(RemoteCommand::Mode(LedMode::On));
    runtime.events_mut().inbox.push(InboundMessage {
        topic: "lightnode/light-node/inbox".to_string(),
        payload: b"hello".to_vec(),
    });

    runtime.tick(0);

    assert_eq!(runtime.engine().mode(), LedMode::Off);
    assert_eq!(runtime.telemetry().inbox.len(), 1);
    assert_eq!(runtime.events().inbox.len(), 1);

    runtime.telemetry_mut().reachable = true;
    runtime.events_mut().reachable = true;
    runtime.tick(10);

    assert_eq!(runtime.engine().mode(), LedMode::On);
    assert!(runtime.events().inbox.is_empty());
}

#[test]
fn display_refreshes_on_its_own_cadence() {
    let mut runtime = runtime(Some(321));

    for now in (0..=100).step_by(10) {
        runtime.tick(now);
    }

    let frames = &runtime.display().frames;
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[2].light, Some(321));
    assert_eq!(frames[2].mode, "OFF");
    assert_eq!(frames[2].telemetry_link, "CONNECTED");
}

#[test]
fn press_is_visible_in_the_same_tick() {
    let mut runtime = runtime(None);
    runtime.tick(0);
    runtime.board_mut().level = false;
    runtime.tick(20);
    runtime.tick(50);

    let last = runtime.display().frames.last().copied();
    assert_eq!(last.map(|frame| frame.mode), Some("ON"));
    assert_eq!(last.map(|frame| frame.led_on), Some(true));
}

#[test]
fn press_between_refreshes_is_rendered_at_once() {
    let mut runtime = runtime(None);
    runtime.tick(0);
    runtime.board_mut().level = false;
    runtime.tick(10);
    runtime.tick(40);

    let frames = &runtime.display().frames;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].mode, "ON");
    assert!(frames[1].led_on);
    assert_eq!(frames[1].button_clicks, 1);

    // The cadence restarts from the forced frame.
    runtime.tick(50);
    runtime.tick(90);
    assert_eq!(runtime.display().frames.len(), 3);
}

#[test]
fn event_inbox_is_joined_on_every_reconnect() {
    let mut runtime = runtime(None);
    runtime.tick(0);
    assert_eq!(runtime.events().subscribed, vec!["lightnode/light-node/inbox"]);

    {
        let events = runtime.events_mut();
        events.reachable = false;
        events.connected = false;
    }
    runtime.tick(10);
    assert_eq!(runtime.event_status(), LinkStatus::Disconnected);
    assert_eq!(runtime.events().subscribed.len(), 1);

    runtime.events_mut().reachable = true;
    runtime.tick(20);

    assert_eq!(
        runtime.events().subscribed,
        vec!["lightnode/light-node/inbox", "lightnode/light-node/inbox"]
    );
    let statuses = runtime
        .events()
        .published
        .iter()
        .filter(|(topic, _, _)| topic.ends_with("/status"))
        .count();
    assert_eq!(statuses, 2);
}

#[test]
fn oversized_event_message_is_discarded() {
    let mut runtime = runtime(None);
    runtime.tick(0);

    runtime.events_mut().inbox.push(InboundMessage {
        topic: "lightnode/light-node/inbox".to_string(),
        payload: vec![b'x'; MAX_REMOTE_PAYLOAD_BYTES + 1],
    });
    runtime.tick(10);

    assert!(runtime.events().inbox.is_empty());
    assert_eq!(runtime.engine().mode(), LedMode::Off);
    assert_eq!(runtime.event_status(), LinkStatus::Connected);
}
