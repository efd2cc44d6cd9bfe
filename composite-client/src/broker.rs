//! Broker interface the client runtime drives. Implementations deliver
//! inbound frames through the event channel handed over on connect.

use std::time::Duration;

use composite_core::{Credentials, Frame, Headers, SubscriptionId};
use tokio::sync::mpsc::UnboundedSender;

/// Something the broker reports back to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected(Frame),
    ConnectFailed(Frame),
    Message {
        subscription: SubscriptionId,
        frame: Frame,
    },
}

/// A publish/subscribe message broker connection.
pub trait Broker: Send + 'static {
    /// Start connecting. The outcome arrives on `events` as `Connected` or
    /// `ConnectFailed`; an `Err` means the attempt could not be made at all.
    fn connect(
        &mut self,
        url: &str,
        credentials: &Credentials,
        heartbeat: Duration,
        events: UnboundedSender<BrokerEvent>,
    ) -> Result<(), BrokerError>;

    fn subscribe(&mut self, id: SubscriptionId, destination: &str) -> Result<(), BrokerError>;

    fn send(&mut self, destination: &str, headers: &Headers, body: &str) -> Result<(), BrokerError>;

    /// Close the connection. Safe to call when not connected.
    fn disconnect(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("not connected to a broker")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
}
