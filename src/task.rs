//! Functions for posting, claiming and draining deferred calls on the
//! globally installed queue.

use crate::platform;
use crate::taskq::{self, Queue};

/// Errors caused during `post`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PostError {
    /// The queue has not been installed using `init_taskq!(...)`
    QueueNotInitialized,

    /// The slot index lies beyond the queue's fixed capacity
    IndexOutOfRange { index: usize, capacity: usize },

    /// The closure's captured state does not fit a slot's payload buffer
    PayloadTooLarge { size: usize, capacity: usize },

    /// `post_once` found an earlier call still pending in the slot
    SlotOccupied { index: usize },
}

/// Errors caused during `claim`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClaimError {
    /// The queue has not been installed using `init_taskq!(...)`
    QueueNotInitialized,

    /// Every slot is already claimed
    SlotsExhausted,
}

/// Exclusive use of one slot of a queue.
///
/// Deliberately neither `Clone` nor `Copy`: as long as a handle is the only
/// way a call site reaches its slot, no second site can post over it.
pub struct SlotHandle<'q> {
    queue: &'q dyn Queue,
    index: usize,
}

impl<'q> SlotHandle<'q> {
    pub(crate) fn new(queue: &'q dyn Queue, index: usize) -> Self {
        Self { queue, index }
    }

    /// The slot index backing this handle.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Post `f` into the owned slot, replacing any pending call there.
    pub fn post<F>(&self, f: F) -> Result<(), PostError>
    where
        F: FnOnce() + Send + 'static,
    {
        taskq::with_raw(f, |task| self.queue.post_raw(task, self.index))
    }

    /// Post `f` into the owned slot, refusing if a call is still pending.
    pub fn post_once<F>(&self, f: F) -> Result<(), PostError>
    where
        F: FnOnce() + Send + 'static,
    {
        taskq::with_raw(f, |task| self.queue.post_once_raw(task, self.index))
    }

    pub fn is_pending(&self) -> bool {
        self.queue.is_posted(self.index)
    }
}

/// Post a deferred call into slot `index` of the global queue.
/// The queue must be installed prior to using this function.
pub fn post<F>(f: F, index: usize) -> Result<(), PostError>
where
    F: FnOnce() + Send + 'static,
{
    match taskq::current() {
        Some(queue) => {
            if queue.is_claimed(index) {
                log::warn!("slot {}: raw post into a claimed slot", index);
            }
            taskq::with_raw(f, |task| queue.post_raw(task, index))
        }
        None => Err(PostError::QueueNotInitialized),
    }
}

/// Post a deferred call into slot `index` of the global queue, refusing if
/// the slot already holds a pending call.
pub fn post_once<F>(f: F, index: usize) -> Result<(), PostError>
where
    F: FnOnce() + Send + 'static,
{
    match taskq::current() {
        Some(queue) => {
            if queue.is_claimed(index) {
                log::warn!("slot {}: raw post into a claimed slot", index);
            }
            taskq::with_raw(f, |task| queue.post_once_raw(task, index))
        }
        None => Err(PostError::QueueNotInitialized),
    }
}

/// Reserve a slot of the global queue for one call site.
pub fn claim(name: &str) -> Result<SlotHandle<'static>, ClaimError> {
    match taskq::current() {
        Some(queue) => queue
            .claim_raw(name)
            .map(|index| SlotHandle::new(queue, index)),
        None => Err(ClaimError::QueueNotInitialized),
    }
}

/// Drain the global queue until no pending calls remain.
///
/// Quietly does nothing when no queue has been installed.
pub fn run_taskq() {
    if let Some(queue) = taskq::current() {
        queue.run();
    }
}

/// Number of pending calls on the global queue.
pub fn pending() -> usize {
    match taskq::current() {
        Some(queue) => queue.pending(),
        None => 0,
    }
}

/// Alternate draining the global queue and sleeping until an event arrives.
pub fn run_forever() -> ! {
    loop {
        run_taskq();
        platform::wait_for_event();
    }
}
