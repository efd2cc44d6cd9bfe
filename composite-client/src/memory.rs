//! In-process broker that plays the Composite server: assigns device ids,
//! answers sync probes, groups devices into sessions and relays session
//! traffic to `/topic/{id}` subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use composite_core::protocol::{
    self, DATA_DESTINATION, DEVICE_QUEUE, DISCONNECT_DESTINATION, INIT_DESTINATION,
    JOIN_DESTINATION, PING_DESTINATION, START_DESTINATION, STOP_DESTINATION, SYNC_DESTINATION,
    UPDATE_DESTINATION,
};
use composite_core::{
    encode_body_as, BodyEncoding, Clock, Credentials, Frame, Headers, SubscriptionId, SystemClock,
};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, BrokerEvent};

struct Connection {
    events: UnboundedSender<BrokerEvent>,
    subscriptions: Vec<(SubscriptionId, String)>,
}

struct Session {
    id: String,
    devices: Vec<String>,
    active: bool,
}

struct Server {
    encoding: BodyEncoding,
    credentials: Credentials,
    clock: SystemClock,
    connections: HashMap<String, Connection>,
    sessions: Vec<Session>,
}

impl Server {
    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Deliver `message` to every subscription on `destination` held by `device`.
    fn deliver(&self, device: &str, destination: &str, message: &Value) {
        let Some(conn) = self.connections.get(device) else {
            return;
        };
        let body = match encode_body_as(message, self.encoding) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(destination, error = %e, "memory broker failed to encode frame");
                return;
            }
        };
        for (id, dest) in &conn.subscriptions {
            if dest == destination {
                let frame = Frame::message(destination, body.clone());
                // Receiver gone means the client shut down; nothing to do.
                let _ = conn.events.send(BrokerEvent::Message {
                    subscription: *id,
                    frame,
                });
            }
        }
    }

    fn broadcast(&self, destination: &str, message: &Value) {
        for device in self.connections.keys() {
            self.deliver(device, destination, message);
        }
    }

    fn session_of(&self, device: &str) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.devices.iter().any(|d| d == device))
    }

    fn device_list(session: &Session) -> Value {
        Value::Array(session.devices.iter().map(|d| json!({"uuid": d})).collect())
    }

    /// Pairwise links between consecutive devices.
    fn links(session: &Session) -> Value {
        let links: Vec<Value> = session
            .devices
            .windows(2)
            .map(|pair| json!({"deviceA": {"uuid": pair[0]}, "deviceB": {"uuid": pair[1]}}))
            .collect();
        Value::Array(links)
    }

    fn join(&mut self, device: &str) {
        let index = match self.session_of(device) {
            Some(index) => index,
            None => {
                let index = match self.sessions.iter().rposition(|s| !s.active) {
                    Some(index) => index,
                    None => {
                        self.sessions.push(Session {
                            id: Uuid::new_v4().simple().to_string(),
                            devices: Vec::new(),
                            active: false,
                        });
                        self.sessions.len() - 1
                    }
                };
                self.sessions[index].devices.push(device.to_owned());
                index
            }
        };
        let session = &self.sessions[index];
        tracing::debug!(session = %session.id, device, members = session.devices.len(), "device joined");
        let reply = json!({
            "type": "join",
            "id": session.id,
            "devices": Self::device_list(session),
        });
        self.deliver(device, DEVICE_QUEUE, &reply);

        let snapshot = json!({"type": "session", "id": session.id, "links": Self::links(session)});
        self.deliver(device, DEVICE_QUEUE, &snapshot);
        self.broadcast(&protocol::session_topic(&session.id), &snapshot);
    }

    fn leave(&mut self, device: &str) {
        let Some(index) = self.session_of(device) else {
            return;
        };
        let session = &mut self.sessions[index];
        session.devices.retain(|d| d != device);
        tracing::debug!(session = %session.id, device, "device left");
        if session.devices.is_empty() {
            self.sessions.remove(index);
            return;
        }
        let session = &self.sessions[index];
        let notice = json!({"type": "disconnect", "devices": Self::device_list(session)});
        self.broadcast(&protocol::session_topic(&session.id), &notice);
    }

    fn session_message(&mut self, device: &str, session_id: &str, mut message: Map<String, Value>) {
        let Some(index) = self.sessions.iter().position(|s| s.id == session_id) else {
            tracing::debug!(session = session_id, "message for unknown session");
            return;
        };
        if !self.sessions[index].devices.iter().any(|d| d == device) {
            tracing::debug!(session = session_id, device, "message from non-member");
            return;
        }
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let topic = protocol::session_topic(session_id);
        match kind.as_str() {
            "start" | "stop" => {
                self.sessions[index].active = kind == "start";
                message.insert("serverTime".into(), self.now().into());
                self.broadcast(&topic, &Value::Object(message));
            }
            "data" | "update" => {
                message.insert("serverTime".into(), self.now().into());
                self.broadcast(&topic, &Value::Object(message));
            }
            "devices" => {
                let list = json!({
                    "type": "devices",
                    "devices": Self::device_list(&self.sessions[index]),
                    "serverTime": self.now(),
                });
                self.broadcast(&topic, &list);
            }
            other => tracing::debug!(kind = other, "unhandled session message"),
        }
    }
}

/// Handle onto a shared in-memory server. Each handle is one client connection.
pub struct MemoryBroker {
    server: Arc<Mutex<Server>>,
    device: Option<String>,
}

impl MemoryBroker {
    /// New server emitting bodies with `encoding`, accepting the default credentials.
    pub fn new(encoding: BodyEncoding) -> Self {
        Self::with_credentials(encoding, Credentials::default())
    }

    pub fn with_credentials(encoding: BodyEncoding, credentials: Credentials) -> Self {
        let server = Server {
            encoding,
            credentials,
            clock: SystemClock,
            connections: HashMap::new(),
            sessions: Vec::new(),
        };
        Self {
            server: Arc::new(Mutex::new(server)),
            device: None,
        }
    }

    /// Another connection to the same server.
    pub fn client(&self) -> Self {
        Self {
            server: self.server.clone(),
            device: None,
        }
    }

    pub fn encoding(&self) -> BodyEncoding {
        self.lock().encoding
    }

    /// Device id the server assigned to this connection.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, Server> {
        self.server.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Broker for MemoryBroker {
    fn connect(
        &mut self,
        url: &str,
        credentials: &Credentials,
        heartbeat: Duration,
        events: UnboundedSender<BrokerEvent>,
    ) -> Result<(), BrokerError> {
        if self.device.is_some() {
            self.disconnect();
        }
        let mut server = self.lock();
        if url.trim().is_empty() || *credentials != server.credentials {
            tracing::debug!(url, login = %credentials.login, "memory broker refused connection");
            let _ = events.send(BrokerEvent::ConnectFailed(Frame::error("access refused")));
            return Ok(());
        }
        let device = Uuid::new_v4().to_string();
        tracing::debug!(url, %device, ?heartbeat, "memory broker accepted connection");
        server.connections.insert(
            device.clone(),
            Connection {
                events: events.clone(),
                subscriptions: Vec::new(),
            },
        );
        drop(server);
        self.device = Some(device);
        let _ = events.send(BrokerEvent::Connected(Frame::connected()));
        Ok(())
    }

    fn subscribe(&mut self, id: SubscriptionId, destination: &str) -> Result<(), BrokerError> {
        let device = self.device.clone().ok_or(BrokerError::NotConnected)?;
        let mut server = self.lock();
        let conn = server
            .connections
            .get_mut(&device)
            .ok_or(BrokerError::NotConnected)?;
        conn.subscriptions.push((id, destination.to_owned()));
        if destination == DEVICE_QUEUE {
            let hello = json!({"type": "subscribe", "uuid": device});
            server.deliver(&device, DEVICE_QUEUE, &hello);
        }
        Ok(())
    }

    fn send(&mut self, destination: &str, _headers: &Headers, body: &str) -> Result<(), BrokerError> {
        let device = self.device.clone().ok_or(BrokerError::NotConnected)?;
        let message: Map<String, Value> = serde_json::from_str(body)
            .map_err(|e| BrokerError::Transport(format!("unparseable body: {}", e)))?;
        let mut server = self.lock();
        match destination {
            INIT_DESTINATION => {
                server.deliver(&device, DEVICE_QUEUE, &json!({"type": "init", "uuid": device}));
            }
            SYNC_DESTINATION => {
                let reply = json!({
                    "type": "sync",
                    "time": message.get("time").cloned().unwrap_or(Value::Null),
                    "serverTime": server.now(),
                });
                server.deliver(&device, DEVICE_QUEUE, &reply);
            }
            PING_DESTINATION => tracing::trace!(%device, "ping"),
            JOIN_DESTINATION => server.join(&device),
            DISCONNECT_DESTINATION => server.leave(&device),
            // Control destinations address the sender's current session.
            DATA_DESTINATION | UPDATE_DESTINATION | START_DESTINATION | STOP_DESTINATION => {
                match server.session_of(&device) {
                    Some(index) => {
                        let session_id = server.sessions[index].id.clone();
                        server.session_message(&device, &session_id, message);
                    }
                    None => tracing::debug!(destination, %device, "device is not in a session"),
                }
            }
            other => match other.strip_prefix("/app/") {
                Some(session_id) => server.session_message(&device, session_id, message),
                None => tracing::debug!(destination = other, "memory broker ignored destination"),
            },
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        let mut server = self.lock();
        server.leave(&device);
        server.connections.remove(&device);
        tracing::debug!(%device, "memory broker closed connection");
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        self.disconnect();
    }
}
