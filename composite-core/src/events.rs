//! Application-facing events and the listener registry.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::device::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Init,
    Synced,
    SessionJoined,
    AppStart,
    AppEnd,
    Data,
    Update,
    DeviceUpdate,
    DeviceDisconnect,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Init,
        EventKind::Synced,
        EventKind::SessionJoined,
        EventKind::AppStart,
        EventKind::AppEnd,
        EventKind::Data,
        EventKind::Update,
        EventKind::DeviceUpdate,
        EventKind::DeviceDisconnect,
    ];

    /// Wire-facing event name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Init => "init",
            EventKind::Synced => "synced",
            EventKind::SessionJoined => "session_joined",
            EventKind::AppStart => "app_start",
            EventKind::AppEnd => "app_end",
            EventKind::Data => "data",
            EventKind::Update => "update",
            EventKind::DeviceUpdate => "device_update",
            EventKind::DeviceDisconnect => "device_disconnect",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown event kind: {}", s))
    }
}

/// Payload of `session_joined`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionJoined {
    pub id: String,
    pub devices: Vec<Device>,
    /// Local device's slot, if it appears in the list.
    pub player: Option<usize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of `device_update`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceUpdate {
    pub devices: Vec<Device>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Raw init payload.
    Init(Map<String, Value>),
    Synced,
    SessionJoined(SessionJoined),
    AppStart { latency: Option<i64> },
    AppEnd { latency: Option<i64> },
    /// Inner data payload tagged with `latency` and `me`.
    Data(Map<String, Value>),
    /// Full update envelope tagged with `me`.
    Update(Map<String, Value>),
    DeviceUpdate(DeviceUpdate),
    DeviceDisconnect,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Init(_) => EventKind::Init,
            Event::Synced => EventKind::Synced,
            Event::SessionJoined(_) => EventKind::SessionJoined,
            Event::AppStart { .. } => EventKind::AppStart,
            Event::AppEnd { .. } => EventKind::AppEnd,
            Event::Data(_) => EventKind::Data,
            Event::Update(_) => EventKind::Update,
            Event::DeviceUpdate(_) => EventKind::DeviceUpdate,
            Event::DeviceDisconnect => EventKind::DeviceDisconnect,
        }
    }
}

/// Opaque handle returned by `on`, used to remove that registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Box<dyn FnMut(&Event) + Send>;

/// Listener that stays registered only while it returns true.
pub type RetainedListener = Box<dyn FnMut(&Event) -> bool + Send>;

/// Listeners per event kind, called in registration order.
#[derive(Default)]
pub struct EventRegistry {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(ListenerId, RetainedListener)>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, kind: EventKind, mut listener: Listener) -> ListenerId {
        self.on_while(
            kind,
            Box::new(move |event: &Event| {
                listener(event);
                true
            }),
        )
    }

    /// Register a listener that is dropped the first time it returns false.
    pub fn on_while(&mut self, kind: EventKind, listener: RetainedListener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.entry(kind).or_default().push((id, listener));
        id
    }

    /// Remove one registration. Returns false if it was not registered under `kind`.
    pub fn off(&mut self, kind: EventKind, id: ListenerId) -> bool {
        let Some(list) = self.listeners.get_mut(&kind) else {
            return false;
        };
        match list.iter().position(|(lid, _)| *lid == id) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn emit(&mut self, event: &Event) {
        let kind = event.kind();
        tracing::trace!(event = %kind, "emit");
        if let Some(list) = self.listeners.get_mut(&kind) {
            list.retain_mut(|(id, listener)| {
                let keep = listener(event);
                if !keep {
                    tracing::trace!(event = %kind, ?id, "listener removed itself");
                }
                keep
            });
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<(&str, usize)> = self
            .listeners
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        counts.sort();
        f.debug_struct("EventRegistry")
            .field("listeners", &counts)
            .finish()
    }
}
