//! Fixed-capacity deferred-call queues, and the globally installed queue.

mod slot;

pub use self::slot::RawTask;
pub(crate) use self::slot::with_raw;

use self::slot::{Payload, Slot};
use crate::platform;
use crate::task::{ClaimError, PostError, SlotHandle};

/// A fixed array of `CAP` slots, each able to hold one deferred call with
/// up to `PAYLOAD` bytes of captured state.
///
/// All storage lives inside the queue itself; posting and draining never
/// allocate. Slots are addressed by index, and each call site is expected
/// to use its own slot, either by convention or through [`claim`].
///
/// [`claim`]: TaskQueue::claim
pub struct TaskQueue<const CAP: usize, const PAYLOAD: usize> {
    slots: [Slot<PAYLOAD>; CAP],
}

// SAFETY: slot interiors are only touched inside a critical section, or
// through `&mut self` on drop
unsafe impl<const CAP: usize, const PAYLOAD: usize> Sync for TaskQueue<CAP, PAYLOAD> {}

impl<const CAP: usize, const PAYLOAD: usize> TaskQueue<CAP, PAYLOAD> {
    pub const fn new() -> Self {
        Self {
            slots: [Slot::EMPTY; CAP],
        }
    }

    /// Post `f` into the slot at `index`, to be invoked by the next drain.
    ///
    /// Posting into a slot that is already pending quietly replaces the
    /// earlier call; only the newest one runs. Use [`post_once`] when that
    /// replacement should be an error instead.
    ///
    /// [`post_once`]: TaskQueue::post_once
    pub fn post<F>(&self, f: F, index: usize) -> Result<(), PostError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.do_is_claimed(index) {
            log::warn!("slot {}: raw post into a claimed slot", index);
        }
        with_raw(f, |task| self.do_post(task, index))
    }

    /// Post `f` into the slot at `index`, refusing if a call is pending
    /// there.
    pub fn post_once<F>(&self, f: F, index: usize) -> Result<(), PostError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.do_is_claimed(index) {
            log::warn!("slot {}: raw post into a claimed slot", index);
        }
        with_raw(f, |task| self.do_post_once(task, index))
    }

    /// Reserve a slot for one call site and hand back its handle.
    ///
    /// Claimed slots stay claimed; there is no way to return one. The
    /// handle can neither be cloned nor copied, so two call sites can only
    /// share a slot by posting raw indices.
    pub fn claim(&self, name: &str) -> Result<SlotHandle<'_>, ClaimError> {
        self.do_claim(name)
            .map(move |index| SlotHandle::new(self, index))
    }

    /// Drain the queue: invoke every pending call, in slot order, then
    /// rescan until a full pass finds nothing to run.
    ///
    /// Calls posted during the drain are picked up by the drain itself; a
    /// task that keeps re-posting forever keeps the drain from returning.
    /// Runs callers' closures with interrupts enabled.
    pub fn run(&self) {
        self.do_run();
    }

    /// Number of slots currently holding a pending call.
    pub fn pending(&self) -> usize {
        self.do_pending()
    }

    pub fn is_posted(&self, index: usize) -> bool {
        self.do_is_posted(index)
    }

    pub fn is_claimed(&self, index: usize) -> bool {
        self.do_is_claimed(index)
    }

    pub fn capacity(&self) -> usize {
        CAP
    }

    pub fn payload_capacity(&self) -> usize {
        PAYLOAD
    }

    fn check(&self, task: &RawTask, index: usize) -> Result<(), PostError> {
        if index >= CAP {
            return Err(PostError::IndexOutOfRange {
                index,
                capacity: CAP,
            });
        }
        if task.len > PAYLOAD {
            return Err(PostError::PayloadTooLarge {
                size: task.len,
                capacity: PAYLOAD,
            });
        }
        Ok(())
    }

    fn do_post(&self, task: RawTask, index: usize) -> Result<(), PostError> {
        self.check(&task, index)?;

        let mut scratch: Payload<PAYLOAD> = Payload::EMPTY;
        let displaced = platform::critical_section(|| {
            // SAFETY: we're inside a global critical section
            unsafe { self.slots[index].install(&task, scratch.as_mut_ptr()) }
        });

        // The replaced call's captures are destroyed with interrupts live.
        if let Some(vtable) = displaced {
            log::trace!("slot {}: replacing a pending call", index);
            // SAFETY: `scratch` owns the payload `install` moved out
            unsafe { (vtable.drop)(scratch.as_mut_ptr()) };
        }

        Ok(())
    }

    fn do_post_once(&self, task: RawTask, index: usize) -> Result<(), PostError> {
        self.check(&task, index)?;

        let mut scratch: Payload<PAYLOAD> = Payload::EMPTY;
        platform::critical_section(|| {
            if self.slots[index].is_posted() {
                return Err(PostError::SlotOccupied { index });
            }
            // SAFETY: we're inside a global critical section
            let displaced = unsafe { self.slots[index].install(&task, scratch.as_mut_ptr()) };
            debug_assert!(displaced.is_none());
            Ok(())
        })
    }

    fn do_claim(&self, name: &str) -> Result<usize, ClaimError> {
        platform::critical_section(|| {
            // Claims grow downward, clear of the low indices that callers
            // conventionally number by hand.
            for index in (0..CAP).rev() {
                let slot = &self.slots[index];
                if slot.is_claimed() {
                    continue;
                }
                slot.claim(name);
                log::trace!("slot {} ({}): claimed", index, name);
                return Ok(index);
            }
            Err(ClaimError::SlotsExhausted)
        })
    }

    fn do_run(&self) {
        if !platform::in_thread_mode() {
            // tried to drain the queue from an interrupt-handler
            platform::abort();
        }

        // Only feed the idle summary below; a perpetually re-posting task
        // keeps this loop alive past any counter's range, so wrap.
        let mut passes: usize = 0;
        let mut executed: usize = 0;

        loop {
            let mut ran_this_pass = 0;

            for index in 0..CAP {
                let mut scratch: Payload<PAYLOAD> = Payload::EMPTY;
                let fired = platform::critical_section(|| {
                    // SAFETY: we're inside a global critical section
                    unsafe { self.slots[index].take(scratch.as_mut_ptr()) }
                });

                if let Some(fired) = fired {
                    log::trace!(
                        "slot {} ({}): invoking",
                        index,
                        fired.name.as_deref().unwrap_or("-")
                    );
                    // SAFETY: `scratch` owns the payload `take` moved out
                    unsafe { (fired.vtable.invoke)(scratch.as_mut_ptr()) };
                    ran_this_pass += 1;
                }
            }

            passes = passes.wrapping_add(1);
            executed = executed.wrapping_add(ran_this_pass);

            if ran_this_pass == 0 {
                break;
            }
        }

        log::debug!("taskq idle: ran {} task(s) over {} pass(es)", executed, passes);
    }

    fn do_pending(&self) -> usize {
        platform::critical_section(|| self.slots.iter().filter(|slot| slot.is_posted()).count())
    }

    fn do_is_posted(&self, index: usize) -> bool {
        index < CAP && self.slots[index].is_posted()
    }

    fn do_is_claimed(&self, index: usize) -> bool {
        index < CAP && self.slots[index].is_claimed()
    }
}

impl<const CAP: usize, const PAYLOAD: usize> Drop for TaskQueue<CAP, PAYLOAD> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.abandon();
        }
    }
}

/// The queue surface the free functions in [`crate::task`] talk to.
///
/// Closures are flattened to [`RawTask`] before they reach this trait, so
/// it stays object-safe and usable behind `&'static dyn Queue`.
pub trait Queue {
    fn post_raw(&self, task: RawTask, index: usize) -> Result<(), PostError>;
    fn post_once_raw(&self, task: RawTask, index: usize) -> Result<(), PostError>;
    fn claim_raw(&self, name: &str) -> Result<usize, ClaimError>;
    fn run(&self);
    fn pending(&self) -> usize;
    fn is_posted(&self, index: usize) -> bool;
    fn is_claimed(&self, index: usize) -> bool;
    fn capacity(&self) -> usize;
    fn payload_capacity(&self) -> usize;
}

impl<const CAP: usize, const PAYLOAD: usize> Queue for TaskQueue<CAP, PAYLOAD> {
    fn post_raw(&self, task: RawTask, index: usize) -> Result<(), PostError> {
        self.do_post(task, index)
    }

    fn post_once_raw(&self, task: RawTask, index: usize) -> Result<(), PostError> {
        self.do_post_once(task, index)
    }

    fn claim_raw(&self, name: &str) -> Result<usize, ClaimError> {
        self.do_claim(name)
    }

    fn run(&self) {
        self.do_run();
    }

    fn pending(&self) -> usize {
        self.do_pending()
    }

    fn is_posted(&self, index: usize) -> bool {
        self.do_is_posted(index)
    }

    fn is_claimed(&self, index: usize) -> bool {
        self.do_is_claimed(index)
    }

    fn capacity(&self) -> usize {
        CAP
    }

    fn payload_capacity(&self) -> usize {
        PAYLOAD
    }
}

/// The globally installed queue. Written once by [`init_taskq!`](crate::init_taskq)
/// during startup, before anything posts; read-only afterwards.
pub static mut TASKQ: Option<&'static dyn Queue> = None;

pub(crate) fn current() -> Option<&'static dyn Queue> {
    // SAFETY: written once during startup, read-only afterwards
    unsafe { TASKQ }
}

/// Declare the slot storage and install it as the global task queue.
///
/// ```ignore
/// init_taskq!(slots: 10, payload: 128);
/// ```
///
/// Must run before any interrupt that posts is enabled.
#[macro_export]
macro_rules! init_taskq {
    (slots: $slots:literal, payload: $payload:literal) => {
        static TASKQ_SLOTS: $crate::taskq::TaskQueue<$slots, $payload> =
            $crate::taskq::TaskQueue::new();

        unsafe {
            $crate::taskq::TASKQ = Some(&TASKQ_SLOTS);
        }
    };
}
