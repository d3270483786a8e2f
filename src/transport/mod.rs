//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Connector` and `Transport` traits, plus the receive-loop runner shared by
//! the client and server. Broker-backed transports are hidden behind feature
//! flags and exposed only through their connectors.
//!
//! Domain code must not depend on transport-specific types.

mod amqp;
mod memory;
mod runner;

#[cfg(feature = "transport_lapin")]
pub use amqp::LapinConnector;

pub use memory::{MemoryConnector, MemoryHub};

pub(crate) use memory::global_hub as memory_global_hub;
pub(crate) use runner::{spawn_consumer, TransportConsumer};
