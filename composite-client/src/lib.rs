//! Composite client runtime: broker interface, in-memory broker and the async
//! client that drives the session coordinator.

pub mod broker;
pub mod client;
pub mod config;
pub mod memory;

pub use broker::{Broker, BrokerError, BrokerEvent};
pub use client::{ClientError, CompositeClient};
pub use memory::MemoryBroker;
