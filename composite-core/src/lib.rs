//! Composite session client core.
//! Host-driven: no I/O; host passes broker events and timer ticks, receives actions.

pub mod adapter;
pub mod clock;
pub mod core;
pub mod device;
pub mod error;
pub mod events;
pub mod protocol;
pub mod wire;

pub use adapter::{AdapterConfig, Credentials, SubscriptionId, TransportAction, TransportAdapter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use core::{
    Action, CoordinatorConfig, Location, Phase, SessionCoordinator, SessionState, TimerKind,
    TimerSchedule,
};
pub use device::{Device, DeviceId};
pub use error::CompositeError;
pub use events::{
    DeviceUpdate, Event, EventKind, Listener, ListenerId, RetainedListener, SessionJoined,
};
pub use wire::{decode_body, encode_body, encode_body_as, BodyDecodeError, BodyEncoding, Frame, Headers};
