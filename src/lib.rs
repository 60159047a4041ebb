//! Relaybus - channel pub/sub over reliable queues
//!
//! Every bus instance owns one durable queue per channel it listens on and
//! advertises it through a shared discovery registry. Publishing a message
//! pushes one copy to each subscribed endpoint's queue, so every subscribing
//! instance receives it once, even if it was offline when it was published.

pub mod bus;
pub mod closer;
pub mod config;
pub mod discovery;
pub mod message;
pub mod queue;

pub use bus::{Bus, BusError, ErrorStream, PublishReport, SubscribeError, Subscription};
pub use config::{BusConfig, Config, DiscoveryConfig};
pub use message::{ArbitraryMessage, Message, MessageId};
