//! Bounded concurrent consumption loop shared by all backends

use futures::{Stream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::TaskError;

/// Admission control for the pool
enum Admission {
    Unbounded,
    Bounded(Arc<Semaphore>),
}

impl Admission {
    async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, TaskError> {
        match self {
            Admission::Unbounded => Ok(None),
            Admission::Bounded(semaphore) => semaphore
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|e| {
                    TaskError::Internal(format!("Failed to acquire semaphore permit: {}", e))
                }),
        }
    }
}

/// Runs deliveries through a handler with at most `max_workers` in flight.
///
/// A permit is taken before the next delivery is pulled, so nothing is read
/// from the stream once the stop signal fires. In-flight handlers are always
/// awaited before `run` returns.
pub struct WorkerPool {
    admission: Admission,
    stop: CancellationToken,
}

impl WorkerPool {
    /// Create a pool; `max_workers == 0` disables admission control
    pub fn new(max_workers: usize, stop: CancellationToken) -> Self {
        let admission = if max_workers == 0 {
            Admission::Unbounded
        } else {
            Admission::Bounded(Arc::new(Semaphore::new(max_workers)))
        };
        Self { admission, stop }
    }

    /// Consume `deliveries` until stopped, the stream fails, or a handler
    /// returns an error.
    pub async fn run<S, T, H, Fut>(&self, mut deliveries: S, handler: H) -> Result<(), TaskError>
    where
        S: Stream<Item = Result<T, TaskError>> + Unpin,
        H: Fn(T) -> Fut,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let mut in_flight: JoinSet<Result<(), TaskError>> = JoinSet::new();

        let outcome = loop {
            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break Ok(()),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = flatten(joined) {
                        break Err(e);
                    }
                    continue;
                }
                permit = self.admission.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(e) => break Err(e),
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break Ok(()),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = flatten(joined) {
                        break Err(e);
                    }
                    continue;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => break Err(e),
                    None if self.stop.is_cancelled() => break Ok(()),
                    None => break Err(TaskError::Connection("Delivery stream closed".to_string())),
                },
            };

            let work = handler(delivery);
            in_flight.spawn(async move {
                let _permit = permit;
                work.await
            });
        };

        tracing::debug!(in_flight = in_flight.len(), "Waiting for in-flight tasks");
        let mut outcome = outcome;
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = flatten(joined) {
                tracing::error!(error = %e, "Task failed while draining");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        outcome
    }
}

fn flatten(joined: Result<Result<(), TaskError>, JoinError>) -> Result<(), TaskError> {
    joined.map_err(|e| TaskError::Internal(format!("Task handler panicked: {}", e)))?
}
