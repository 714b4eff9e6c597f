use super::Releaser;

/// Ownership of one concurrency slot, acquired via
/// [Limiter::acquire_slot](super::Limiter::acquire_slot).
///
/// The slot is given back when the permit is dropped, at which point the
/// limiter hands it to the next waiter or queued job. Drop the permit from
/// within the runtime: handing the slot to a queued job spawns a task.
#[derive(Debug)]
pub struct SlotPermit {
    releaser: Option<Box<dyn Releaser>>,
}

impl SlotPermit {
    pub(crate) fn new(releaser: Box<dyn Releaser>) -> Self {
        Self {
            releaser: Some(releaser),
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.releaser
            .take()
            .expect("releaser should exist until drop")
            .release();
    }
}
