//! Concurrent teardown of several resources.
//!
//! A [`CloseGroup`] launches each close as its own task, waits for all of
//! them, and reports every failure. With a timeout, the wait is abandoned when
//! it expires; closes still running keep running in the background.
//!
//! ```ignore
//! let mut group = CloseGroup::new().with_timeout(Duration::from_secs(5));
//! group.close(queue);
//! group.spawn(async move { discovery.unregister(&channel, &endpoint).await });
//! group.wait().await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::{debug, warn};

/// Boxed error from a single close.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of waiting on a [`CloseGroup`].
#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    #[error("{} of {total} resources failed to close", .errors.len())]
    Failed { total: usize, errors: Vec<BoxError> },

    #[error("Timed out after {0:?} waiting for resources to close")]
    TimedOut(Duration),
}

impl CloseError {
    /// Individual failures, empty on timeout.
    pub fn errors(&self) -> &[BoxError] {
        match self {
            Self::Failed { errors, .. } => errors,
            Self::TimedOut(_) => &[],
        }
    }
}

/// A resource that can be shut down.
#[async_trait]
pub trait Closable: Send + Sync {
    async fn close(&self) -> Result<(), BoxError>;
}

/// Fan-out close and wait.
#[derive(Default)]
pub struct CloseGroup {
    slots: Vec<BoxFuture<'static, Result<(), BoxError>>>,
    timeout: Option<Duration>,
}

impl CloseGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up waiting after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set or clear the timeout.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a slot running an arbitrary close future.
    pub fn spawn<F, E>(&mut self, close: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.slots
            .push(async move { close.await.map_err(Into::into) }.boxed());
    }

    /// Add a slot closing `resource`.
    pub fn close<C: Closable + ?Sized + 'static>(&mut self, resource: Arc<C>) {
        self.spawn(async move { resource.close().await });
    }

    /// Add a slot with nothing to do.
    pub fn bypass(&mut self) {
        self.slots.push(async { Ok(()) }.boxed());
    }

    /// Number of slots added so far.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Run every slot concurrently and wait for all of them.
    pub async fn wait(self) -> Result<(), CloseError> {
        let total = self.slots.len();
        let handles: Vec<_> = self.slots.into_iter().map(tokio::spawn).collect();

        // Dropping a JoinHandle detaches the task, so a timeout stops the wait
        // without cancelling closes in flight.
        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, join_all(handles)).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(total, timeout = ?limit, "Timed out waiting for resources to close");
                    return Err(CloseError::TimedOut(limit));
                }
            },
            None => join_all(handles).await,
        };

        let errors: Vec<BoxError> = joined
            .into_iter()
            .filter_map(|outcome| match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(join) => Some(Box::new(join) as BoxError),
            })
            .collect();

        if errors.is_empty() {
            debug!(total, "All resources closed");
            Ok(())
        } else {
            warn!(total, failed = errors.len(), "Some resources failed to close");
            Err(CloseError::Failed { total, errors })
        }
    }
}
