//! Composite wire protocol: destinations, envelope kinds and protocol constants.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::{Device, DeviceId};

/// Control destination the adapter sends the handshake `init` to.
pub const INIT_DESTINATION: &str = "/app/init";
pub const JOIN_DESTINATION: &str = "/app/join";
pub const SYNC_DESTINATION: &str = "/app/sync";
pub const DISCONNECT_DESTINATION: &str = "/app/disconnect";
pub const PING_DESTINATION: &str = "/app/ping";
/// Server-side control routes addressing the sender's current session. The
/// client itself sends session traffic to [`session_destination`] instead.
pub const UPDATE_DESTINATION: &str = "/app/update";
pub const DATA_DESTINATION: &str = "/app/data";
pub const START_DESTINATION: &str = "/app/start";
pub const STOP_DESTINATION: &str = "/app/stop";
/// Personal inbox every device subscribes to right after connecting.
pub const DEVICE_QUEUE: &str = "/user/queue/device";

/// Number of sync round trips collected before the clock offset is committed.
pub const SYNC_SAMPLES: usize = 11;
/// Number of latency samples averaged into the public latency value.
pub const LATENCY_WINDOW: usize = 10;

/// Keep-alive interval negotiated for both directions.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const PING_INTERVAL: Duration = Duration::from_millis(250);
/// Delay between a join response and the follow-up `devices` request.
pub const DEVICE_REFRESH_DELAY: Duration = Duration::from_millis(100);

pub const DEFAULT_LOGIN: &str = "guest";
pub const DEFAULT_PASSCODE: &str = "guest";

/// Join mode sent when the caller does not set `type` on a join request.
pub const DEFAULT_JOIN_KIND: &str = "exit";

/// Broker command acknowledging a successful connect.
pub const CONNECTED_COMMAND: &str = "CONNECTED";

/// Outbound destination for messages addressed to a session.
pub fn session_destination(session_id: &str) -> String {
    format!("/app/{}", session_id)
}

/// Broadcast topic carrying a session's traffic.
pub fn session_topic(session_id: &str) -> String {
    format!("/topic/{}", session_id)
}

/// Messages the coordinator understands, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Init,
    Sync {
        time: i64,
        #[serde(rename = "serverTime")]
        server_time: i64,
    },
    Join {
        id: String,
        devices: Vec<Device>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Start,
    Stop,
    Data {
        data: Map<String, Value>,
    },
    Update {
        data: Map<String, Value>,
    },
    Devices {
        devices: Vec<Device>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Disconnect {
        devices: Vec<Device>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    #[serde(other)]
    Unknown,
}

/// Messages the transport adapter classifies on its own, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Control {
    Init,
    Subscribe { uuid: DeviceId },
    Join { id: String },
    Devices,
    Session(SessionLinks),
    Payload,
    #[serde(other)]
    Unknown,
}

/// Session-link snapshot: pairwise links between the session's devices.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionLinks {
    #[serde(default)]
    pub links: Vec<DeviceLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceLink {
    #[serde(rename = "deviceA")]
    pub device_a: LinkSlot,
    #[serde(rename = "deviceB")]
    pub device_b: LinkSlot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkSlot {
    pub uuid: DeviceId,
}

/// Typed messages this client sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Init,
    Sync { time: i64 },
    Devices,
    Data { data: Map<String, Value> },
    Update { data: Map<String, Value> },
    Start,
    Stop,
}
