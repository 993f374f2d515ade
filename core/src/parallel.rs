//! Bounded parallel task runner.
//!
//! Runs a task for every index in `0..pieces` with at most `workers`
//! running at once, and collects the failures. A failing or panicking
//! index never stops its siblings.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// A pool task that panicked instead of returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPanic {
    pub index: usize,
    pub message: String,
}

impl fmt::Display for TaskPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} panicked: {}", self.index, self.message)
    }
}

/// Run `task(i)` for each `i` in `0..pieces` with at most `workers` in
/// flight.
///
/// Returns one error per failing index in completion order. Every index is
/// attempted exactly once; a panic is recorded as that index's error via
/// `E: From<TaskPanic>`. Dropping the returned future aborts anything still
/// running.
pub async fn parallelize<F, Fut, E>(workers: usize, pieces: usize, task: F) -> Vec<E>
where
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: From<TaskPanic> + Send + 'static,
{
    if pieces == 0 {
        return Vec::new();
    }

    let task = Arc::new(task);
    let permits = Arc::new(Semaphore::new(workers.clamp(1, pieces)));
    let errors = Arc::new(Mutex::new(Vec::with_capacity(pieces)));

    let mut set = JoinSet::new();
    for index in 0..pieces {
        let task = task.clone();
        let permits = permits.clone();
        let errors = errors.clone();
        set.spawn(async move {
            // The semaphore is never closed, so acquisition only waits.
            let _permit = permits.acquire_owned().await;

            // A nested set isolates the task's panic and aborts it if this
            // wrapper is dropped.
            let mut one = JoinSet::new();
            one.spawn(async move { task(index).await });
            let failure = match one.join_next().await {
                Some(Ok(Ok(()))) | None => None,
                Some(Ok(Err(e))) => Some(e),
                Some(Err(join)) => {
                    let panic = TaskPanic {
                        index,
                        message: panic_message(join),
                    };
                    tracing::error!(index, error = %panic, "Parallel task panicked");
                    Some(E::from(panic))
                }
            };
            if let Some(e) = failure {
                errors.lock().push(e);
            }
        });
    }

    while set.join_next().await.is_some() {}

    let collected = std::mem::take(&mut *errors.lock());
    collected
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
