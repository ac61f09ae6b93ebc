//! Slot storage and the closure-to-payload encoding.

use core::cell::UnsafeCell;
use core::mem::{self, ManuallyDrop, MaybeUninit};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use heapless::String;

use crate::task::PostError;

/// Nothing stored; the payload bytes are garbage.
pub(crate) const SLOT_EMPTY: u8 = 0;
/// A task is pending; payload, length and vtable are valid.
pub(crate) const SLOT_POSTED: u8 = 1;

pub(crate) const NAME_LENGTH: usize = 16;

pub(crate) type SlotName = String<NAME_LENGTH>;

/// Fixed storage for one captured closure. Aligned so that ordinary
/// captures land on their natural boundary; the trampolines move payloads
/// with unaligned reads, so over-aligned captures are still sound.
#[repr(C, align(8))]
pub(crate) struct Payload<const N: usize> {
    bytes: MaybeUninit<[u8; N]>,
}

impl<const N: usize> Payload<N> {
    pub(crate) const EMPTY: Self = Self {
        bytes: MaybeUninit::uninit(),
    };

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr() as *mut u8
    }
}

/// How to interpret a stored payload: call it, or destroy it unrun.
///
/// One promoted instance exists per posted closure type, minted the same
/// way `RawWakerVTable` trampolines are.
pub(crate) struct SlotVTable {
    pub(crate) invoke: unsafe fn(*mut u8),
    pub(crate) drop: unsafe fn(*mut u8),
}

fn vtable_of<F: FnOnce() + Send + 'static>() -> &'static SlotVTable {
    &SlotVTable {
        invoke: invoke_raw::<F>,
        drop: drop_raw::<F>,
    }
}

/// Move the closure out of `payload` and call it. `payload` must hold a
/// valid `F`; its bytes are dead once this returns.
unsafe fn invoke_raw<F: FnOnce() + Send + 'static>(payload: *mut u8) {
    let task = (payload as *mut F).read_unaligned();
    task();
}

/// Move the closure out of `payload` and release its captures unrun.
unsafe fn drop_raw<F: FnOnce() + Send + 'static>(payload: *mut u8) {
    drop((payload as *mut F).read_unaligned());
}

/// A closure reduced to the unified form a slot can store: the address and
/// size of its captured state, plus the vtable that knows how to decode it.
pub struct RawTask {
    pub(crate) ptr: *const u8,
    pub(crate) len: usize,
    pub(crate) vtable: &'static SlotVTable,
}

/// Encode `f` and hand it to `post`. On success the slot owns the closure's
/// bytes; on failure the closure is dropped here, captures and all.
pub(crate) fn with_raw<F, P>(f: F, post: P) -> Result<(), PostError>
where
    F: FnOnce() + Send + 'static,
    P: FnOnce(RawTask) -> Result<(), PostError>,
{
    let mut f = ManuallyDrop::new(f);
    let task = RawTask {
        ptr: &mut f as *mut ManuallyDrop<F> as *const u8,
        len: mem::size_of::<F>(),
        vtable: vtable_of::<F>(),
    };

    let result = post(task);
    if result.is_err() {
        // SAFETY: the slot never took ownership of the bytes
        unsafe { ManuallyDrop::drop(&mut f) };
    }
    result
}

/// What a drain pulls out of a posted slot.
pub(crate) struct Fired {
    pub(crate) vtable: &'static SlotVTable,
    pub(crate) name: Option<SlotName>,
}

/// One fixed queue position.
///
/// `payload`, `len` and `vtable` are valid exactly while `state` is
/// `SLOT_POSTED`. All shared access runs inside a critical section; `Drop`
/// cleanup relies on exclusivity instead.
pub(crate) struct Slot<const PAYLOAD: usize> {
    state: AtomicU8,
    claimed: AtomicBool,
    name: UnsafeCell<Option<SlotName>>,
    len: UnsafeCell<usize>,
    vtable: UnsafeCell<Option<&'static SlotVTable>>,
    payload: UnsafeCell<Payload<PAYLOAD>>,
}

impl<const PAYLOAD: usize> Slot<PAYLOAD> {
    pub(crate) const EMPTY: Self = Self {
        state: AtomicU8::new(SLOT_EMPTY),
        claimed: AtomicBool::new(false),
        name: UnsafeCell::new(None),
        len: UnsafeCell::new(0),
        vtable: UnsafeCell::new(None),
        payload: UnsafeCell::new(Payload::EMPTY),
    };

    pub(crate) fn is_posted(&self) -> bool {
        self.state.load(Ordering::Relaxed) == SLOT_POSTED
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Relaxed)
    }

    /// Reserve this slot for one call site. Must run inside a critical
    /// section.
    pub(crate) fn claim(&self, name: &str) {
        self.claimed.store(true, Ordering::Relaxed);
        // SAFETY: we're inside a global critical section
        unsafe {
            *self.name.get() = Some(clipped(name));
        }
    }

    /// Store `task` here, displacing whatever was pending.
    ///
    /// If a task was displaced, its payload is copied into `displaced` and
    /// its vtable returned so the caller can destroy it outside the
    /// critical section. Must run inside a critical section; `displaced`
    /// must have room for `PAYLOAD` bytes.
    pub(crate) unsafe fn install(
        &self,
        task: &RawTask,
        displaced: *mut u8,
    ) -> Option<&'static SlotVTable> {
        let old = if self.is_posted() {
            self.state.store(SLOT_EMPTY, Ordering::Relaxed);
            ptr::copy_nonoverlapping(self.payload.get() as *const u8, displaced, *self.len.get());
            (*self.vtable.get()).take()
        } else {
            None
        };

        ptr::copy_nonoverlapping(task.ptr, self.payload.get() as *mut u8, task.len);
        *self.len.get() = task.len;
        *self.vtable.get() = Some(task.vtable);
        self.state.store(SLOT_POSTED, Ordering::Release);

        old
    }

    /// Clear the posted flag and move the pending task out into `dst`.
    ///
    /// The flag is cleared before the payload leaves the slot, so a task
    /// re-posting its own index is seen on a later pass instead of lost.
    /// Must run inside a critical section; `dst` must have room for
    /// `PAYLOAD` bytes.
    pub(crate) unsafe fn take(&self, dst: *mut u8) -> Option<Fired> {
        if !self.is_posted() {
            return None;
        }

        self.state.store(SLOT_EMPTY, Ordering::Relaxed);
        ptr::copy_nonoverlapping(self.payload.get() as *const u8, dst, *self.len.get());
        let vtable = (*self.vtable.get()).take()?;

        Some(Fired {
            vtable,
            name: (*self.name.get()).clone(),
        })
    }

    /// Destroy a pending task in place. Exclusive access only.
    pub(crate) fn abandon(&mut self) {
        if !self.is_posted() {
            return;
        }

        self.state.store(SLOT_EMPTY, Ordering::Relaxed);
        // SAFETY: `&mut self` rules out any concurrent slot access
        unsafe {
            if let Some(vtable) = (*self.vtable.get()).take() {
                (vtable.drop)(self.payload.get() as *mut u8);
            }
        }
    }
}

fn clipped(name: &str) -> SlotName {
    let mut out = SlotName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{clipped, with_raw, Payload};
    use crate::task::PostError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropProbe(Arc<AtomicUsize>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn capture_dropped_when_post_refuses() {
        let drops = Arc::new(AtomicUsize::new(0));
        let probe = DropProbe(drops.clone());

        let result = with_raw(
            move || {
                let _probe = probe;
            },
            |_task| Err(PostError::SlotOccupied { index: 3 }),
        );

        assert_eq!(result, Err(PostError::SlotOccupied { index: 3 }));
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn trampoline_invokes_the_stored_bytes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let recorded = hits.clone();

        let mut buffer = Payload::<64>::EMPTY;
        let result = with_raw(
            move || {
                recorded.fetch_add(1, Ordering::Relaxed);
            },
            |task| {
                assert!(task.len <= 64);
                unsafe {
                    core::ptr::copy_nonoverlapping(task.ptr, buffer.as_mut_ptr(), task.len);
                    (task.vtable.invoke)(buffer.as_mut_ptr());
                }
                Ok(())
            },
        );

        assert_eq!(result, Ok(()));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn capture_free_closures_are_zero_sized() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let result = with_raw(
            || {
                HITS.fetch_add(1, Ordering::Relaxed);
            },
            |task| {
                assert_eq!(task.len, 0);
                let mut buffer = Payload::<8>::EMPTY;
                unsafe { (task.vtable.invoke)(buffer.as_mut_ptr()) };
                Ok(())
            },
        );

        assert_eq!(result, Ok(()));
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn names_clip_to_capacity() {
        assert_eq!(clipped("tick").as_str(), "tick");
        assert_eq!(clipped("a-name-way-past-sixteen").as_str(), "a-name-way-past-");
    }
}
