//! Host-driven API: SessionCoordinator receives broker events from the host and
//! returns actions (sends, subscriptions, timer changes) for the host to run.

use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::adapter::{AdapterConfig, TransportAction, TransportAdapter};
use crate::clock::{self, Clock, ClockSync, LatencyWindow, SystemClock};
use crate::device::{self, Device, DeviceId};
use crate::error::CompositeError;
use crate::events::{DeviceUpdate, Event, EventKind, EventRegistry, ListenerId, SessionJoined};
use crate::protocol::{
    self, Inbound, Outbound, DEFAULT_JOIN_KIND, DEVICE_REFRESH_DELAY, DISCONNECT_DESTINATION,
    JOIN_DESTINATION, PING_DESTINATION, PING_INTERVAL, SYNC_DESTINATION,
};
use crate::wire::{self, BodyEncoding, Frame, Headers};

/// Timers the coordinator asks the host to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Ping,
    DeviceRefresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSchedule {
    Once(Duration),
    Every(Duration),
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Transport(TransportAction),
    /// Start (or restart) a timer; the host calls `on_timer` when it fires.
    StartTimer(TimerKind, TimerSchedule),
    CancelTimer(TimerKind),
}

fn transport(actions: Vec<TransportAction>) -> Vec<Action> {
    actions.into_iter().map(Action::Transport).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub adapter: AdapterConfig,
    /// Encoding of inbound bodies as seen by the coordinator.
    pub encoding: BodyEncoding,
    pub ping_interval: Duration,
    pub device_refresh_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            encoding: BodyEncoding::Single,
            ping_interval: PING_INTERVAL,
            device_refresh_delay: DEVICE_REFRESH_DELAY,
        }
    }
}

/// Geographic position sent with join requests as `[latitude, longitude]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    fn to_value(self) -> Value {
        Value::Array(vec![self.latitude.into(), self.longitude.into()])
    }
}

impl Serialize for Location {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.latitude, self.longitude].serialize(serializer)
    }
}

/// Where the client is in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Joined { host: bool },
    Active { host: bool },
}

/// Read-only copy of the coordinator's session state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub phase: Phase,
    pub uuid: Option<DeviceId>,
    pub session: Option<String>,
    pub host: bool,
    pub active: bool,
    pub time_difference: Option<i64>,
    pub latency: Option<i64>,
    pub device_index: Option<usize>,
    pub location: Option<Location>,
}

/// Main coordinator. Host passes events; coordinator returns actions.
pub struct SessionCoordinator {
    adapter: TransportAdapter,
    clock: Box<dyn Clock>,
    encoding: BodyEncoding,
    ping_interval: Duration,
    device_refresh_delay: Duration,
    events: EventRegistry,
    connecting: bool,
    connected: bool,
    uuid: Option<DeviceId>,
    session: Option<String>,
    host: bool,
    active: bool,
    location: Option<Location>,
    time_difference: Option<i64>,
    clock_sync: Option<ClockSync>,
    latency: LatencyWindow,
}

impl SessionCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_clock(config, Box::new(SystemClock))
    }

    pub fn with_clock(config: CoordinatorConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            adapter: TransportAdapter::new(config.adapter),
            clock,
            encoding: config.encoding,
            ping_interval: config.ping_interval,
            device_refresh_delay: config.device_refresh_delay,
            events: EventRegistry::new(),
            connecting: false,
            connected: false,
            uuid: None,
            session: None,
            host: false,
            active: false,
            location: None,
            time_difference: None,
            clock_sync: None,
            latency: LatencyWindow::new(),
        }
    }

    // --- host-facing entry points -------------------------------------------

    pub fn connect(&mut self, url: &str) -> Result<Vec<Action>, CompositeError> {
        let actions = self.adapter.connect(url)?;
        self.connecting = true;
        Ok(transport(actions))
    }

    /// Broker accepted the connection.
    pub fn on_connected(&mut self, frame: &Frame) -> Vec<Action> {
        let mut actions = transport(self.adapter.on_connected());
        actions.extend(self.on_raw_frame(frame));
        actions
    }

    /// Broker refused the connection. No retry; the client stays disconnected.
    pub fn on_connect_failed(&mut self, frame: &Frame) -> Vec<Action> {
        self.connecting = false;
        let mut actions = transport(self.adapter.on_connect_failed(frame));
        actions.extend(self.on_raw_frame(frame));
        actions
    }

    /// Inbound frame on any subscription. The adapter classifies it first,
    /// then the coordinator handles the same raw frame.
    pub fn on_frame(&mut self, frame: &Frame) -> Vec<Action> {
        let mut actions = transport(self.adapter.on_frame(frame));
        actions.extend(self.on_raw_frame(frame));
        actions
    }

    pub fn on_timer(&mut self, timer: TimerKind) -> Vec<Action> {
        tracing::trace!(?timer, "timer fired");
        match timer {
            TimerKind::Ping => {
                if !self.connected {
                    return Vec::new();
                }
                self.send(&Map::new(), PING_DESTINATION)
            }
            TimerKind::DeviceRefresh => match self.session.as_deref() {
                Some(session) => {
                    self.send(&Outbound::Devices, &protocol::session_destination(session))
                }
                None => Vec::new(),
            },
        }
    }

    // --- application operations ---------------------------------------------

    /// Ask the broker to place this device in a session.
    pub fn join(&mut self, data: Option<Map<String, Value>>) -> Result<Vec<Action>, CompositeError> {
        let Some(uuid) = self.uuid.clone() else {
            return Err(CompositeError::Precondition(
                "must wait until the connection is established before joining".into(),
            ));
        };
        let Some(location) = self.location else {
            return Err(CompositeError::Precondition(
                "location must be set before a session can be joined".into(),
            ));
        };
        let mut request = data.unwrap_or_default();
        request
            .entry("type")
            .or_insert_with(|| Value::from(DEFAULT_JOIN_KIND));
        request.entry("geo").or_insert_with(|| location.to_value());
        let device = request
            .entry("device")
            .or_insert_with(|| Value::Object(Map::new()));
        if !device.is_object() {
            *device = Value::Object(Map::new());
        }
        if let Value::Object(device) = device {
            device.insert("uuid".into(), Value::String(uuid.to_string()));
        }
        Ok(self.send(&request, JOIN_DESTINATION))
    }

    pub fn send_data(&mut self, payload: Map<String, Value>) -> Vec<Action> {
        let Some(data) = self.stamp_uuid(payload) else {
            return Vec::new();
        };
        self.send_to_session(&Outbound::Data { data })
    }

    pub fn send_update(&mut self, payload: Map<String, Value>) -> Vec<Action> {
        let Some(data) = self.stamp_uuid(payload) else {
            return Vec::new();
        };
        self.send_to_session(&Outbound::Update { data })
    }

    fn stamp_uuid(&self, mut payload: Map<String, Value>) -> Option<Map<String, Value>> {
        self.session.as_ref()?;
        let uuid = self
            .uuid
            .as_ref()
            .map_or(Value::Null, |id| Value::String(id.to_string()));
        payload.insert("uuid".into(), uuid);
        Some(payload)
    }

    /// Host only.
    pub fn start_app(&mut self) -> Vec<Action> {
        if !self.host {
            return Vec::new();
        }
        self.send_to_session(&Outbound::Start)
    }

    /// Host only.
    pub fn end_app(&mut self) -> Vec<Action> {
        if !self.host {
            return Vec::new();
        }
        self.send_to_session(&Outbound::Stop)
    }

    /// Restart clock synchronization, discarding any partial round.
    pub fn sync_time(&mut self) -> Vec<Action> {
        self.clock_sync = Some(ClockSync::new());
        self.request_sync_sample()
    }

    pub fn set_location(&mut self, location: Location) {
        self.location = Some(location);
    }

    /// Announce departure, close the connection and cancel every timer.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = self.send(&Map::new(), DISCONNECT_DESTINATION);
        actions.extend(transport(self.adapter.disconnect()));
        actions.push(Action::CancelTimer(TimerKind::Ping));
        actions.push(Action::CancelTimer(TimerKind::DeviceRefresh));
        if self.connected || self.connecting {
            tracing::debug!(session = ?self.session, "disconnected");
        }
        self.connecting = false;
        self.connected = false;
        self.uuid = None;
        self.session = None;
        self.host = false;
        self.active = false;
        self.clock_sync = None;
        actions
    }

    pub fn on<F>(&mut self, kind: EventKind, listener: F) -> ListenerId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.events.on(kind, Box::new(listener))
    }

    /// Like `on`, but the listener is removed the first time it returns false.
    pub fn on_while<F>(&mut self, kind: EventKind, listener: F) -> ListenerId
    where
        F: FnMut(&Event) -> bool + Send + 'static,
    {
        self.events.on_while(kind, Box::new(listener))
    }

    pub fn off(&mut self, kind: EventKind, id: ListenerId) -> bool {
        self.events.off(kind, id)
    }

    // --- inbound handling ---------------------------------------------------

    fn on_raw_frame(&mut self, frame: &Frame) -> Vec<Action> {
        if frame.is_connected() {
            return self.handle_connected();
        }
        match frame.body.as_deref() {
            Some(body) => self.handle_body(body),
            None => Vec::new(),
        }
    }

    fn handle_connected(&mut self) -> Vec<Action> {
        if self.connected {
            return Vec::new();
        }
        self.connecting = false;
        self.connected = true;
        tracing::debug!(url = ?self.adapter.url(), "connected");
        let mut actions = vec![Action::StartTimer(
            TimerKind::Ping,
            TimerSchedule::Every(self.ping_interval),
        )];
        actions.extend(self.begin_sync());
        actions
    }

    fn handle_body(&mut self, body: &str) -> Vec<Action> {
        let mut envelope = match wire::decode_body(body, self.encoding) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable frame");
                return Vec::new();
            }
        };
        let latency = self.frame_latency(&envelope);
        if let Some(latency) = latency {
            envelope.insert("latency".into(), latency.into());
        }
        let raw = Value::Object(envelope);
        let message = match Inbound::deserialize(&raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed envelope");
                return Vec::new();
            }
        };
        let Value::Object(raw) = raw else {
            return Vec::new();
        };

        match message {
            Inbound::Init => self.handle_init(raw),
            Inbound::Sync { time, server_time } => self.handle_sync(time, server_time),
            Inbound::Join { id, devices, extra } => self.handle_join(id, devices, extra),
            Inbound::Start => {
                self.active = true;
                self.events.emit(&Event::AppStart { latency });
                Vec::new()
            }
            Inbound::Stop => {
                self.active = false;
                self.events.emit(&Event::AppEnd { latency });
                Vec::new()
            }
            Inbound::Data { mut data } => {
                if let Some(latency) = latency {
                    data.insert("latency".into(), latency.into());
                }
                let me = self.is_me(data.get("uuid"));
                data.insert("me".into(), Value::Bool(me));
                self.events.emit(&Event::Data(data));
                Vec::new()
            }
            Inbound::Update { .. } => {
                let mut envelope = raw;
                let me = self.is_me(envelope.get("data").and_then(|d| d.get("uuid")));
                envelope.insert("me".into(), Value::Bool(me));
                self.events.emit(&Event::Update(envelope));
                Vec::new()
            }
            Inbound::Devices { devices, extra } => {
                self.refresh_devices(devices, extra);
                Vec::new()
            }
            Inbound::Disconnect { devices, extra } => {
                self.refresh_devices(devices, extra);
                self.events.emit(&Event::DeviceDisconnect);
                Vec::new()
            }
            Inbound::Unknown => {
                tracing::trace!(kind = ?raw.get("type"), "ignoring unknown message kind");
                Vec::new()
            }
        }
    }

    /// Latency of one frame against the committed clock offset. `None` until
    /// synced; `Some(0)` for frames without a server timestamp.
    fn frame_latency(&mut self, envelope: &Map<String, Value>) -> Option<i64> {
        let offset = self.time_difference?;
        let Some(server_time) = envelope.get("serverTime").and_then(Value::as_i64) else {
            return Some(0);
        };
        let difference = self.clock.now_ms() - server_time;
        let latency = (difference.abs() - offset.abs()).abs();
        self.latency.record(latency);
        Some(latency)
    }

    fn handle_init(&mut self, raw: Map<String, Value>) -> Vec<Action> {
        match raw.get("uuid").and_then(Value::as_str) {
            Some(uuid) => {
                tracing::debug!(uuid, "device registered");
                self.uuid = Some(DeviceId::new(uuid));
            }
            None => tracing::warn!("init without a device id"),
        }
        let actions = self.begin_sync();
        self.events.emit(&Event::Init(raw));
        actions
    }

    /// Start a sync round unless one is already collecting samples.
    fn begin_sync(&mut self) -> Vec<Action> {
        if self.clock_sync.is_some() {
            return Vec::new();
        }
        self.sync_time()
    }

    fn request_sync_sample(&mut self) -> Vec<Action> {
        let time = self.clock.now_ms();
        self.send(&Outbound::Sync { time }, SYNC_DESTINATION)
    }

    fn handle_sync(&mut self, sent: i64, server_time: i64) -> Vec<Action> {
        if self.clock_sync.is_none() {
            tracing::trace!("sync reply outside a sync round");
            return Vec::new();
        }
        let now = self.clock.now_ms();
        let latency = clock::half_round_trip(now, sent);
        self.latency.record(latency);
        let difference = (now - latency) - server_time;

        let committed = self
            .clock_sync
            .as_mut()
            .and_then(|sync| sync.record(difference));
        match committed {
            Some(offset) => {
                self.clock_sync = None;
                self.time_difference = Some(offset);
                tracing::debug!(offset, latency = ?self.latency.latency(), "clock synchronized");
                self.events.emit(&Event::Synced);
                Vec::new()
            }
            None => self.request_sync_sample(),
        }
    }

    fn handle_join(
        &mut self,
        id: String,
        devices: Vec<Device>,
        extra: Map<String, Value>,
    ) -> Vec<Action> {
        if self.session.is_some() {
            tracing::trace!(session = %id, "already in a session; join ignored");
            return Vec::new();
        }
        let player = self
            .uuid
            .as_ref()
            .and_then(|me| device::find_me_index(&devices, me));
        self.host = player == Some(0);
        self.session = Some(id.clone());
        tracing::debug!(session = %id, ?player, host = self.host, "joined session");
        self.events.emit(&Event::SessionJoined(SessionJoined {
            id,
            devices,
            player,
            extra,
        }));
        vec![Action::StartTimer(
            TimerKind::DeviceRefresh,
            TimerSchedule::Once(self.device_refresh_delay),
        )]
    }

    fn refresh_devices(&mut self, mut devices: Vec<Device>, extra: Map<String, Value>) {
        device::mark_me(&mut devices, self.uuid.as_ref());
        let host = device::is_host(&devices);
        if host != self.host {
            tracing::debug!(host, "host status changed");
        }
        self.host = host;
        self.events
            .emit(&Event::DeviceUpdate(DeviceUpdate { devices, extra }));
    }

    fn is_me(&self, uuid: Option<&Value>) -> bool {
        match (uuid.and_then(Value::as_str), self.uuid.as_ref()) {
            (Some(uuid), Some(me)) => uuid == me.as_str(),
            _ => false,
        }
    }

    fn send_to_session<T: Serialize + ?Sized>(&self, message: &T) -> Vec<Action> {
        match self.session.as_deref() {
            Some(session) => self.send(message, &protocol::session_destination(session)),
            None => Vec::new(),
        }
    }

    fn send<T: Serialize + ?Sized>(&self, message: &T, destination: &str) -> Vec<Action> {
        if !self.adapter.is_open() {
            tracing::debug!(destination, "not connected; message dropped");
            return Vec::new();
        }
        self.adapter
            .send_message(message, Some(destination), Some(Headers::new()))
            .map(Action::Transport)
            .into_iter()
            .collect()
    }

    // --- accessors ----------------------------------------------------------

    pub fn phase(&self) -> Phase {
        match (self.connected, self.session.is_some(), self.active) {
            (true, true, true) => Phase::Active { host: self.host },
            (true, true, false) => Phase::Joined { host: self.host },
            (true, false, _) => Phase::Connected,
            (false, _, _) if self.connecting => Phase::Connecting,
            _ => Phase::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            phase: self.phase(),
            uuid: self.uuid.clone(),
            session: self.session.clone(),
            host: self.host,
            active: self.active,
            time_difference: self.time_difference,
            latency: self.latency.latency(),
            device_index: self.adapter.device_index(),
            location: self.location,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn uuid(&self) -> Option<&DeviceId> {
        self.uuid.as_ref()
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn is_host(&self) -> bool {
        self.host
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn time_difference(&self) -> Option<i64> {
        self.time_difference
    }

    pub fn latency(&self) -> Option<i64> {
        self.latency.latency()
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    pub fn adapter(&self) -> &TransportAdapter {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut TransportAdapter {
        &mut self.adapter
    }
}

impl Default for SessionCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}
