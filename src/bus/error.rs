//! Bus error types.

use std::fmt;

use crate::closer::CloseError;
use crate::discovery::DiscoveryError;
use crate::queue::QueueError;

use super::Subscription;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Queue error on endpoint '{endpoint}': {source}")]
    Queue {
        endpoint: String,
        #[source]
        source: QueueError,
    },

    #[error("Failed to decode message from endpoint '{endpoint}': {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Teardown failed: {0}")]
    Close(#[from] CloseError),

    #[error("Bus closed")]
    Closed,
}

impl BusError {
    pub(crate) fn queue(endpoint: &str, source: QueueError) -> Self {
        Self::Queue {
            endpoint: endpoint.to_string(),
            source,
        }
    }
}

/// Failure from [`Bus::subscribe`](super::Bus::subscribe).
///
/// A registration failure does not prevent the local stream from being
/// built: `Registration` still carries a working subscription, which
/// receives anything already queued for this endpoint but is invisible to
/// publishers until registration succeeds.
pub enum SubscribeError<M> {
    Registration {
        source: DiscoveryError,
        subscription: Subscription<M>,
    },
    Bus(BusError),
}

impl<M> SubscribeError<M> {
    /// The subscription built despite the failure, if any.
    pub fn into_subscription(self) -> Option<Subscription<M>> {
        match self {
            Self::Registration { subscription, .. } => Some(subscription),
            Self::Bus(_) => None,
        }
    }

    /// Drop the subscription and keep the error.
    pub fn into_bus_error(self) -> BusError {
        match self {
            Self::Registration { source, .. } => BusError::Discovery(source),
            Self::Bus(e) => e,
        }
    }
}

impl<M> From<BusError> for SubscribeError<M> {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

impl<M> fmt::Debug for SubscribeError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration {
                source,
                subscription,
            } => f
                .debug_struct("Registration")
                .field("source", source)
                .field("endpoint", &subscription.endpoint())
                .finish(),
            Self::Bus(e) => f.debug_tuple("Bus").field(e).finish(),
        }
    }
}

impl<M> fmt::Display for SubscribeError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration { source, .. } => write!(f, "Registration failed: {}", source),
            Self::Bus(e) => write!(f, "{}", e),
        }
    }
}

impl<M> std::error::Error for SubscribeError<M> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Registration { source, .. } => Some(source),
            Self::Bus(e) => Some(e),
        }
    }
}
