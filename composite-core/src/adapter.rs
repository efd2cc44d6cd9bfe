//! Transport adapter: connection handshake, inbox subscription, outbound
//! serialization and the adapter-level frame classifier.
//!
//! Like the coordinator, the adapter performs no I/O. Every operation returns
//! the [`TransportAction`]s the host must carry out against the broker.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::DeviceId;
use crate::error::CompositeError;
use crate::protocol::{
    self, Control, SessionLinks, DEFAULT_LOGIN, DEFAULT_PASSCODE, DEVICE_QUEUE, HEARTBEAT_INTERVAL,
    INIT_DESTINATION,
};
use crate::wire::{self, BodyEncoding, Frame, Headers};

/// Credential pair presented to the broker on connect.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub passcode: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            login: DEFAULT_LOGIN.to_owned(),
            passcode: DEFAULT_PASSCODE.to_owned(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("passcode", &"***")
            .finish()
    }
}

/// Opaque subscription handle, allocated by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Work for the host to perform against the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportAction {
    Open {
        url: String,
        credentials: Credentials,
        heartbeat: Duration,
    },
    Subscribe {
        id: SubscriptionId,
        destination: String,
    },
    Send {
        destination: String,
        headers: Headers,
        body: String,
    },
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    pub credentials: Credentials,
    pub heartbeat: Duration,
    /// Encoding of inbound bodies as seen by the adapter classifier.
    pub encoding: BodyEncoding,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            heartbeat: HEARTBEAT_INTERVAL,
            encoding: BodyEncoding::Double,
        }
    }
}

pub type SnapshotHandler = Box<dyn FnMut(&Map<String, Value>) + Send>;

pub struct TransportAdapter {
    config: AdapterConfig,
    url: Option<String>,
    open: bool,
    next_subscription: u64,
    subscriptions: Vec<(SubscriptionId, String)>,
    id: Option<SubscriptionId>,
    uuid: Option<DeviceId>,
    session: Option<String>,
    session_data: Option<Map<String, Value>>,
    device_index: Option<usize>,
    on_payload: Option<SnapshotHandler>,
    on_session: Option<SnapshotHandler>,
}

impl TransportAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            url: None,
            open: false,
            next_subscription: 0,
            subscriptions: Vec::new(),
            id: None,
            uuid: None,
            session: None,
            session_data: None,
            device_index: None,
            on_payload: None,
            on_session: None,
        }
    }

    /// Begin connecting to `url`. The host reports the outcome through
    /// [`on_connected`](Self::on_connected) or [`on_connect_failed`](Self::on_connect_failed).
    pub fn connect(&mut self, url: &str) -> Result<Vec<TransportAction>, CompositeError> {
        if url.trim().is_empty() {
            return Err(CompositeError::Configuration(
                "an endpoint url is required to connect".into(),
            ));
        }
        self.url = Some(url.to_owned());
        self.session_data = None;
        self.device_index = None;
        tracing::debug!(url, "opening broker connection");
        Ok(vec![TransportAction::Open {
            url: url.to_owned(),
            credentials: self.config.credentials.clone(),
            heartbeat: self.config.heartbeat,
        }])
    }

    /// Broker accepted the connection: subscribe to the inbox and send `init`.
    pub fn on_connected(&mut self) -> Vec<TransportAction> {
        self.open = true;
        let (id, subscribe) = self.subscribe(DEVICE_QUEUE);
        self.id = Some(id);
        let mut actions = vec![subscribe];
        actions.extend(self.send_message(
            &protocol::Outbound::Init,
            Some(INIT_DESTINATION),
            None,
        ));
        actions
    }

    /// Broker refused or dropped the connection attempt.
    pub fn on_connect_failed(&mut self, frame: &Frame) -> Vec<TransportAction> {
        tracing::warn!(
            reason = frame.headers.get("message").map(String::as_str).unwrap_or(""),
            "broker connection failed"
        );
        self.reset();
        vec![TransportAction::Close]
    }

    /// Tear the connection down. Safe to call repeatedly.
    pub fn disconnect(&mut self) -> Vec<TransportAction> {
        self.reset();
        vec![TransportAction::Close]
    }

    fn reset(&mut self) {
        self.open = false;
        self.subscriptions.clear();
        self.id = None;
        self.uuid = None;
        self.session = None;
    }

    /// Serialize `message` and address it to `destination`, falling back to the
    /// current session destination. Returns `None` when there is nowhere to send.
    pub fn send_message<T: Serialize + ?Sized>(
        &self,
        message: &T,
        destination: Option<&str>,
        headers: Option<Headers>,
    ) -> Option<TransportAction> {
        let Some(destination) = destination.or(self.session.as_deref()) else {
            tracing::warn!("dropping outbound message: no destination and no session");
            return None;
        };
        let body = match wire::encode_body(message) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(destination, error = %e, "dropping outbound message");
                return None;
            }
        };
        Some(TransportAction::Send {
            destination: destination.to_owned(),
            headers: headers.unwrap_or_default(),
            body,
        })
    }

    pub fn subscribe(&mut self, destination: &str) -> (SubscriptionId, TransportAction) {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscriptions.push((id, destination.to_owned()));
        tracing::debug!(%id, destination, "subscribing");
        (
            id,
            TransportAction::Subscribe {
                id,
                destination: destination.to_owned(),
            },
        )
    }

    /// Classify one inbound frame. Frames that fail to decode are logged and
    /// dropped here; the caller still processes the raw frame afterwards.
    pub fn on_frame(&mut self, frame: &Frame) -> Vec<TransportAction> {
        let Some(body) = frame.body.as_deref() else {
            return Vec::new();
        };
        let envelope = match wire::decode_body(body, self.config.encoding) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, "adapter dropped undecodable frame");
                return Vec::new();
            }
        };
        let control = match Control::deserialize(&Value::Object(envelope.clone())) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "adapter dropped malformed envelope");
                return Vec::new();
            }
        };
        tracing::trace!(?control, "adapter classified frame");
        let mut actions = Vec::new();
        match control {
            Control::Init | Control::Devices | Control::Unknown => {}
            Control::Subscribe { uuid } => {
                tracing::debug!(%uuid, "broker assigned device id");
                self.uuid = Some(uuid);
            }
            Control::Join { id } => actions.push(self.create_session(&id)),
            Control::Session(links) => self.session_update(&links, envelope),
            Control::Payload => {
                if let Some(handler) = self.on_payload.as_mut() {
                    handler(&envelope);
                }
            }
        }
        actions
    }

    fn create_session(&mut self, session_id: &str) -> TransportAction {
        self.session = Some(protocol::session_destination(session_id));
        let (_, action) = self.subscribe(&protocol::session_topic(session_id));
        action
    }

    /// Cache the snapshot; the device index is derived from the first one only.
    fn session_update(&mut self, links: &SessionLinks, snapshot: Map<String, Value>) {
        if self.session_data.is_none() {
            if let Some(me) = self.uuid.as_ref() {
                self.device_index = link_index(links, me);
                tracing::debug!(device_index = ?self.device_index, "derived device index from links");
            }
        }
        if let Some(handler) = self.on_session.as_mut() {
            handler(&snapshot);
        }
        self.session_data = Some(snapshot);
    }

    pub fn set_payload_handler(&mut self, handler: SnapshotHandler) {
        self.on_payload = Some(handler);
    }

    pub fn set_session_handler(&mut self, handler: SnapshotHandler) {
        self.on_session = Some(handler);
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Handle of the inbox subscription.
    pub fn id(&self) -> Option<SubscriptionId> {
        self.id
    }

    pub fn uuid(&self) -> Option<&DeviceId> {
        self.uuid.as_ref()
    }

    pub fn device_index(&self) -> Option<usize> {
        self.device_index
    }

    pub fn session_data(&self) -> Option<&Map<String, Value>> {
        self.session_data.as_ref()
    }

    pub fn subscriptions(&self) -> &[(SubscriptionId, String)] {
        &self.subscriptions
    }
}

impl Default for TransportAdapter {
    fn default() -> Self {
        Self::new(AdapterConfig::default())
    }
}

impl fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportAdapter")
            .field("url", &self.url)
            .field("open", &self.open)
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("session", &self.session)
            .field("device_index", &self.device_index)
            .finish_non_exhaustive()
    }
}

/// Early ordinal hint from pairwise links.
///
/// A counter advances once per link examined; the first link also advances it
/// for its second slot when its first slot did not match. Later links only
/// inspect their second slot. Every link overwrites the result, a miss with 0,
/// so the last link decides. `None` only when there are no links.
fn link_index(links: &SessionLinks, me: &DeviceId) -> Option<usize> {
    let mut counter = 0usize;
    let mut index = None;
    for (n, link) in links.links.iter().enumerate() {
        let slot = counter;
        counter += 1;
        let hit = if n == 0 {
            if link.device_a.uuid == *me {
                Some(slot)
            } else {
                counter += 1;
                (link.device_b.uuid == *me).then_some(slot + 1)
            }
        } else {
            (link.device_b.uuid == *me).then_some(slot)
        };
        index = Some(hit.unwrap_or(0));
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_body_as;
    use serde_json::json;

    fn double(value: Value) -> Frame {
        Frame::message(DEVICE_QUEUE, encode_body_as(&value, BodyEncoding::Double).unwrap())
    }

    fn links(pairs: &[(&str, &str)]) -> SessionLinks {
        let value = json!({
            "links": pairs
                .iter()
                .map(|(a, b)| json!({"deviceA": {"uuid": a}, "deviceB": {"uuid": b}}))
                .collect::<Vec<_>>()
        });
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn connect_requires_url() {
        let mut adapter = TransportAdapter::default();
        assert!(matches!(
            adapter.connect(""),
            Err(CompositeError::Configuration(_))
        ));
        let actions = adapter.connect("ws://broker/composite").unwrap();
        match &actions[..] {
            [TransportAction::Open {
                url,
                credentials,
                heartbeat,
            }] => {
                assert_eq!(url, "ws://broker/composite");
                assert_eq!(credentials.login, "guest");
                assert_eq!(*heartbeat, Duration::from_secs(10));
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[test]
    fn connected_subscribes_inbox_then_sends_init() {
        let mut adapter = TransportAdapter::default();
        adapter.connect("ws://broker").unwrap();
        let actions = adapter.on_connected();
        assert_eq!(actions.len(), 2);
        match &actions[0] {
            TransportAction::Subscribe { id, destination } => {
                assert_eq!(destination, DEVICE_QUEUE);
                assert_eq!(adapter.id(), Some(*id));
            }
            other => panic!("expected Subscribe, got {:?}", other),
        }
        match &actions[1] {
            TransportAction::Send {
                destination, body, headers,
            } => {
                assert_eq!(destination, INIT_DESTINATION);
                assert_eq!(body, r#"{"type":"init"}"#);
                assert!(headers.is_empty());
            }
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[test]
    fn connect_failure_closes() {
        let mut adapter = TransportAdapter::default();
        adapter.connect("ws://broker").unwrap();
        let actions = adapter.on_connect_failed(&Frame::error("bad credentials"));
        assert_eq!(actions, vec![TransportAction::Close]);
        assert!(!adapter.is_open());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut adapter = TransportAdapter::default();
        adapter.connect("ws://broker").unwrap();
        adapter.on_connected();
        assert_eq!(adapter.disconnect(), vec![TransportAction::Close]);
        assert_eq!(adapter.disconnect(), vec![TransportAction::Close]);
        assert!(adapter.subscriptions().is_empty());
    }

    #[test]
    fn subscribe_message_captures_uuid() {
        let mut adapter = TransportAdapter::default();
        adapter.on_frame(&double(json!({"type": "subscribe", "uuid": "dev-1"})));
        assert_eq!(adapter.uuid().map(DeviceId::as_str), Some("dev-1"));
    }

    #[test]
    fn join_subscribes_to_session_topic_and_sets_default_destination() {
        let mut adapter = TransportAdapter::default();
        let actions = adapter.on_frame(&double(json!({"type": "join", "id": "s42"})));
        match &actions[..] {
            [TransportAction::Subscribe { destination, .. }] => {
                assert_eq!(destination, "/topic/s42")
            }
            other => panic!("unexpected actions: {:?}", other),
        }
        match adapter.send_message(&protocol::Outbound::Start, None, None) {
            Some(TransportAction::Send { destination, .. }) => assert_eq!(destination, "/app/s42"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn send_without_destination_is_dropped() {
        let adapter = TransportAdapter::default();
        assert!(adapter
            .send_message(&protocol::Outbound::Start, None, None)
            .is_none());
    }

    #[test]
    fn malformed_and_unknown_frames_are_ignored() {
        let mut adapter = TransportAdapter::default();
        let garbage = Frame::message(DEVICE_QUEUE, "{{nope".into());
        assert!(adapter.on_frame(&garbage).is_empty());
        let unknown = double(json!({"type": "weather", "sunny": true}));
        assert!(adapter.on_frame(&unknown).is_empty());
        assert!(adapter.on_frame(&Frame::connected()).is_empty());
    }

    #[test]
    fn payload_forwarded_to_handler() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut adapter = TransportAdapter::default();
        adapter.set_payload_handler(Box::new(move |m| sink.lock().unwrap().push(m.clone())));
        adapter.on_frame(&double(json!({"type": "payload", "x": 1})));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["x"], 1);
    }

    #[test]
    fn link_index_two_devices() {
        let l = links(&[("A", "B")]);
        assert_eq!(link_index(&l, &"A".into()), Some(0));
        assert_eq!(link_index(&l, &"B".into()), Some(1));
        assert_eq!(link_index(&l, &"Z".into()), Some(0));
        assert_eq!(link_index(&links(&[]), &"A".into()), None);
    }

    #[test]
    fn link_index_chain_is_decided_by_last_link() {
        let l = links(&[("A", "B"), ("B", "C")]);
        assert_eq!(link_index(&l, &"B".into()), Some(0));
        assert_eq!(link_index(&l, &"C".into()), Some(2));
        assert_eq!(link_index(&l, &"Z".into()), Some(0));

        let l = links(&[("A", "B"), ("B", "C"), ("C", "D")]);
        assert_eq!(link_index(&l, &"C".into()), Some(0));
        assert_eq!(link_index(&l, &"D".into()), Some(3));
    }

    #[test]
    fn session_handler_sees_every_snapshot_in_order() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut adapter = TransportAdapter::default();
        adapter.set_session_handler(Box::new(move |m| sink.lock().unwrap().push(m["rev"].clone())));
        for rev in 1..=2 {
            adapter.on_frame(&double(json!({
                "type": "session",
                "links": [{"deviceA": {"uuid": "A"}, "deviceB": {"uuid": "B"}}],
                "rev": rev
            })));
        }
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn device_index_only_from_first_snapshot() {
        let mut adapter = TransportAdapter::default();
        adapter.on_frame(&double(json!({"type": "subscribe", "uuid": "B"})));
        let first = json!({
            "type": "session",
            "links": [{"deviceA": {"uuid": "A"}, "deviceB": {"uuid": "B"}}]
        });
        adapter.on_frame(&double(first));
        assert_eq!(adapter.device_index(), Some(1));

        let second = json!({
            "type": "session",
            "links": [{"deviceA": {"uuid": "B"}, "deviceB": {"uuid": "C"}}],
            "rev": 2
        });
        adapter.on_frame(&double(second));
        assert_eq!(adapter.device_index(), Some(1));
        assert_eq!(adapter.session_data().unwrap()["rev"], 2);
    }
}
