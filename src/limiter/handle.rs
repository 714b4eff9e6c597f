use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

/// A handle to one submitted job's eventual outcome.
///
/// Starts out pending and settles exactly once, when the job finishes
/// (successfully or not). Cheaply cloneable: every clone observes the same
/// outcome, so a handle can be kept by the submitter while the
/// [Limiter](super::Limiter)'s registry holds another copy.
pub struct TaskHandle<T, E> {
    shared: Arc<Shared<T, E>>,
}

struct Shared<T, E> {
    outcome: Mutex<Option<Result<T, E>>>,
    settled: Notify,
}

impl<T, E> TaskHandle<T, E> {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                outcome: Mutex::new(None),
                settled: Notify::new(),
            }),
        }
    }

    /// Whether the job has finished.
    pub fn is_settled(&self) -> bool {
        self.lock_outcome().is_some()
    }

    /// Settle the handle and wake anyone in [TaskHandle::wait].
    ///
    /// Must be called exactly once, by the job wrapper.
    pub(crate) fn settle(&self, outcome: Result<T, E>) {
        let mut slot = self.lock_outcome();
        debug_assert!(slot.is_none(), "a task handle must settle exactly once");
        *slot = Some(outcome);
        drop(slot);
        self.shared.settled.notify_waiters();
    }

    fn lock_outcome(&self) -> std::sync::MutexGuard<'_, Option<Result<T, E>>> {
        self.shared
            .outcome
            .lock()
            .expect("lock should not be poisoned")
    }
}

impl<T, E> TaskHandle<T, E>
where
    T: Clone,
    E: Clone,
{
    /// The outcome, if the job has finished.
    pub fn try_outcome(&self) -> Option<Result<T, E>> {
        self.lock_outcome().clone()
    }

    /// Wait until the job finishes and return its outcome.
    pub async fn wait(&self) -> Result<T, E> {
        loop {
            let notified = self.shared.settled.notified();
            tokio::pin!(notified);
            // Register for a wake-up before checking, so a settle landing
            // between the check and the await can't be missed.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_outcome() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl<T, E> Clone for TaskHandle<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_until_settled() {
        let handle = TaskHandle::<u32, &str>::new();
        assert!(!handle.is_settled());
        assert_eq!(handle.try_outcome(), None);

        handle.settle(Ok(7));

        assert!(handle.is_settled());
        assert_eq!(handle.try_outcome(), Some(Ok(7)));
        assert_eq!(handle.wait().await, Ok(7));
    }

    #[tokio::test]
    async fn wakes_waiters_on_settle() {
        let handle = TaskHandle::<u32, &str>::new();

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait().await }
        });
        tokio::task::yield_now().await;

        handle.settle(Err("boom"));

        assert_eq!(waiter.await.unwrap(), Err("boom"));
    }

    #[tokio::test]
    async fn clones_observe_the_same_outcome() {
        let handle = TaskHandle::<u32, &str>::new();
        let clone = handle.clone();

        handle.settle(Ok(1));

        assert_eq!(clone.wait().await, Ok(1));
        assert_eq!(handle.wait().await, Ok(1));
    }
}
