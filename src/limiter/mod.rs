//! The limiter: slot accounting, the two queuing disciplines, and the
//! hand-off protocol for freed slots.
//!
//! A [Limiter] caps how many jobs run at once. Jobs are submitted either
//! with [Limiter::schedule_submit] (fire-and-forget: returns a handle
//! immediately, deferring the start if the limiter is saturated) or with
//! [Limiter::enqueue_submit] (backpressure: suspends the caller until the
//! job has actually started running). When a job finishes, its slot is
//! handed to the oldest waiting [Limiter::acquire_slot] caller, or failing
//! that to the oldest deferred job; each queue is strictly FIFO, and
//! waiters always go ahead of deferred jobs.

use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::oneshot;
use tracing::trace;

pub use handle::TaskHandle;
pub use permit::SlotPermit;

mod handle;
mod permit;

type CapacityUnit = usize;

/// A submitted job, boxed so it can sit in the ready-queue.
type Job<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

/// Limits the number of concurrently running jobs to a fixed capacity.
///
/// Every submitted job is recorded in an append-only registry, so aggregate
/// results can be gathered with [Limiter::collect] and completion observed
/// with [Limiter::progress]. A job's failure is carried only by its own
/// [TaskHandle]; it never poisons the limiter or affects sibling jobs.
///
/// Jobs run as spawned tasks, so a tokio runtime must be available.
pub struct Limiter<T, E> {
    max: CapacityUnit,
    state: Mutex<State<T, E>>,
}

/// All mutable limiter state lives behind one lock, so slot accounting and
/// queue updates are atomic with respect to each other.
struct State<T, E> {
    current: CapacityUnit,
    /// Deferred starts from [Limiter::schedule_submit], FIFO.
    ready: VecDeque<ReadyEntry<T, E>>,
    /// Pending slot acquisitions, FIFO, serviced before the ready-queue.
    ///
    /// The grant is an owned [SlotPermit]: if the waiter is gone by the time
    /// it arrives, the permit's drop returns the slot instead of leaking it.
    waiters: VecDeque<oneshot::Sender<SlotPermit>>,
    /// Append-only registry of every submitted job.
    tasks: Vec<TaskHandle<T, E>>,
}

/// A deferred start: the captured job plus the handle it settles.
struct ReadyEntry<T, E> {
    job: Job<T, E>,
    handle: TaskHandle<T, E>,
}

/// A snapshot of the state of the [Limiter].
///
/// Consistent at the instant it was taken, but possibly already stale by the
/// time it is read.
#[derive(Debug, Clone, Copy)]
pub struct LimiterState {
    capacity: CapacityUnit,
    in_flight: CapacityUnit,
    queued: usize,
    waiting: usize,
}

/// Errors constructing a [Limiter].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The capacity must be at least one.
    #[error("capacity must be at least 1")]
    InvalidCapacity,
}

pub(crate) trait Releaser: Debug + Send + Sync {
    fn release(&self);
}

impl<T, E> Limiter<T, E> {
    /// Create a limiter that runs at most `capacity` jobs concurrently.
    pub fn new(capacity: CapacityUnit) -> Result<Arc<Self>, Error> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        Ok(Arc::new(Self {
            max: capacity,
            state: Mutex::new(State {
                current: 0,
                ready: VecDeque::new(),
                waiters: VecDeque::new(),
                tasks: Vec::new(),
            }),
        }))
    }

    /// The maximum number of concurrently running jobs.
    pub fn capacity(&self) -> CapacityUnit {
        self.max
    }

    /// The number of jobs ever submitted, via either submission API.
    pub fn total(&self) -> usize {
        self.lock_state().tasks.len()
    }

    /// The number of submitted jobs that have finished and given their slot
    /// back.
    ///
    /// Slots held through [Limiter::acquire_slot] are not tied to a
    /// submitted job, so while one is held this undercounts rather than
    /// underflows.
    pub fn progress(&self) -> usize {
        let state = self.lock_state();
        state
            .tasks
            .len()
            .saturating_sub(state.current + state.ready.len())
    }

    /// Every handle ever registered, in submission order.
    pub fn tasks(&self) -> Vec<TaskHandle<T, E>> {
        self.lock_state().tasks.clone()
    }

    /// The current state of the limiter.
    pub fn state(&self) -> LimiterState {
        let state = self.lock_state();
        LimiterState {
            capacity: self.max,
            in_flight: state.current,
            queued: state.ready.len(),
            waiting: state.waiters.len(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State<T, E>> {
        self.state.lock().expect("lock should not be poisoned")
    }
}

impl<T, E> Limiter<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wait for exclusive ownership of one concurrency slot.
    ///
    /// Used internally by [Limiter::enqueue_submit], but can be used
    /// externally to reserve capacity for work the limiter does not run
    /// itself. The slot is given back when the permit is dropped.
    pub async fn acquire_slot(self: &Arc<Self>) -> SlotPermit {
        self.acquire().await
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire_slot(self: &Arc<Self>) -> Option<SlotPermit> {
        let mut state = self.lock_state();
        if state.current < self.max {
            state.current += 1;
            drop(state);
            Some(self.mint_permit())
        } else {
            None
        }
    }

    /// Submit a job and wait until it has started running.
    ///
    /// This is the backpressure-providing API: it suspends until a slot is
    /// free *and* the job's execution has begun, so when it returns the job
    /// is genuinely in flight. The returned handle yields the job's eventual
    /// outcome.
    pub async fn enqueue_submit<Fut>(self: &Arc<Self>, job: Fut) -> TaskHandle<T, E>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let permit = self.acquire().await;
        let handle = TaskHandle::new();
        self.lock_state().tasks.push(handle.clone());
        let (started_tx, started_rx) = oneshot::channel();
        Self::spawn_job(Box::pin(job), handle.clone(), permit, Some(started_tx));
        // Fails only during runtime shutdown, when the job task is dropped
        // before it is polled.
        let _ = started_rx.await;
        handle
    }

    /// Submit a job without waiting: fire-and-forget.
    ///
    /// The handle is registered and returned immediately. The job starts now
    /// if a slot is free, otherwise it joins the ready-queue and starts, in
    /// FIFO order, once earlier jobs finish. The caller is never blocked, at
    /// the cost of not knowing when execution truly starts.
    pub fn schedule_submit<Fut>(self: &Arc<Self>, job: Fut) -> TaskHandle<T, E>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let handle = TaskHandle::new();
        let mut state = self.lock_state();
        state.tasks.push(handle.clone());
        if state.current < self.max {
            state.current += 1;
            drop(state);
            Self::spawn_job(Box::pin(job), handle.clone(), self.mint_permit(), None);
        } else {
            state.ready.push_back(ReadyEntry {
                job: Box::pin(job),
                handle: handle.clone(),
            });
            trace!(queued = state.ready.len(), "job deferred");
        }
        handle
    }

    /// Wait until the caller owns a slot.
    ///
    /// Fast path: a free slot is claimed under the lock with no suspension.
    /// Otherwise the caller joins the waiter-queue and `release` transfers a
    /// slot to it, accounting included, by sending a permit as the grant.
    async fn acquire(self: &Arc<Self>) -> SlotPermit {
        let granted = {
            let mut state = self.lock_state();
            if state.current < self.max {
                state.current += 1;
                trace!(in_flight = state.current, "slot acquired");
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                trace!(waiting = state.waiters.len(), "waiting for a slot");
                Some(rx)
            }
        };
        match granted {
            None => self.mint_permit(),
            Some(granted) => granted
                .await
                .expect("a queued waiter is only removed by granting it a slot"),
        }
    }

    /// Give a slot back and hand it to whoever is next.
    ///
    /// Runs exactly once per slot owner, from [SlotPermit] drop. Waiters
    /// always win over the ready-queue, and `current` is re-incremented at
    /// the grant site, so every increment is owned by exactly one live
    /// permit. A waiter that is gone, or that drops its grant unobserved,
    /// drops the granted permit and the slot comes straight back through
    /// here.
    fn release(self: &Arc<Self>) {
        let mut state = self.lock_state();
        state.current -= 1;
        if let Some(waiter) = state.waiters.pop_front() {
            // The slot is transferred, not freed: account for the new owner
            // before sending the grant.
            state.current += 1;
            trace!(in_flight = state.current, "slot handed to waiter");
            drop(state);
            let _ = waiter.send(self.mint_permit());
            return;
        }
        match state.ready.pop_front() {
            Some(entry) => {
                state.current += 1;
                trace!(
                    in_flight = state.current,
                    queued = state.ready.len(),
                    "starting deferred job"
                );
                drop(state);
                Self::spawn_job(entry.job, entry.handle, self.mint_permit(), None);
            }
            None => {
                trace!(in_flight = state.current, "slot freed");
            }
        }
    }

    fn mint_permit(self: &Arc<Self>) -> SlotPermit {
        SlotPermit::new(Box::new(Arc::clone(self)))
    }

    /// Run a job on the runtime: settle its handle when it finishes, then
    /// give the slot back by dropping its permit. `started`, if present, is
    /// signalled after the job's first poll, i.e. once execution has
    /// genuinely begun.
    fn spawn_job(
        job: Job<T, E>,
        handle: TaskHandle<T, E>,
        permit: SlotPermit,
        started: Option<oneshot::Sender<()>>,
    ) {
        tokio::spawn(async move {
            let mut job = job;
            let mut started = started;
            let outcome = std::future::poll_fn(|cx| {
                let poll = job.as_mut().poll(cx);
                if let Some(tx) = started.take() {
                    let _ = tx.send(());
                }
                poll
            })
            .await;
            handle.settle(outcome);
            drop(permit);
        });
    }
}

impl<T, E> Limiter<T, E>
where
    T: Clone,
    E: Clone,
{
    /// Wait for every registered job to finish.
    ///
    /// Returns the successful results in submission order, or the first
    /// failure in that order. Jobs submitted after `collect` was called are
    /// not waited for.
    pub async fn collect(&self) -> Result<Vec<T>, E> {
        let handles = self.lock_state().tasks.clone();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.wait().await?);
        }
        Ok(results)
    }
}

impl<T, E> Releaser for Arc<Limiter<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn release(&self) {
        Limiter::release(self);
    }
}

impl<T, E> Debug for Limiter<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Limiter")
            .field("capacity", &self.max)
            .field("in_flight", &state.current)
            .field("queued", &state.ready.len())
            .field("waiting", &state.waiters.len())
            .field("total", &state.tasks.len())
            .finish()
    }
}

impl LimiterState {
    /// The maximum number of concurrently running jobs.
    pub fn capacity(&self) -> CapacityUnit {
        self.capacity
    }
    /// The number of slots currently in use.
    pub fn in_flight(&self) -> CapacityUnit {
        self.in_flight
    }
    /// The number of deferred jobs in the ready-queue.
    pub fn queued(&self) -> usize {
        self.queued
    }
    /// The number of callers waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting
    }
}
