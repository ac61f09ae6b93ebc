#[cfg(target_arch = "arm")]
pub(crate) use self::arm::critical_section;

#[cfg(target_arch = "arm")]
pub(crate) use self::arm::in_thread_mode;

#[cfg(target_arch = "arm")]
pub(crate) use self::arm::wait_for_event;

#[cfg(target_arch = "arm")]
pub(crate) use cortex_m::asm::udf as abort;

#[cfg(not(target_arch = "arm"))]
pub(crate) use self::host::critical_section;

#[cfg(not(target_arch = "arm"))]
pub(crate) use self::host::in_thread_mode;

#[cfg(not(target_arch = "arm"))]
pub(crate) use self::host::wait_for_event;

#[cfg(not(target_arch = "arm"))]
pub(crate) use self::host::abort;

#[cfg(all(not(target_arch = "arm"), not(feature = "std"), not(test)))]
compile_error!("drogue-taskq needs the `std` feature on non-ARM targets");

#[cfg(target_arch = "arm")]
mod arm {
    /// Run `f` with interrupts masked.
    pub fn critical_section<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        cortex_m::interrupt::free(|_cs| f())
    }

    pub fn in_thread_mode() -> bool {
        const SCB_ICSR: *const u32 = 0xE000_ED04 as *const u32;
        // VECTACTIVE == 0 means no exception is being serviced
        // NOTE(unsafe) single-instruction load with no side effects
        unsafe { SCB_ICSR.read_volatile() & 0x1FF == 0 }
    }

    #[inline]
    /// Wait for an interrupt or until notified by another execution context.
    pub fn wait_for_event() {
        cortex_m::asm::wfe();
    }
}

#[cfg(not(target_arch = "arm"))]
mod host {
    use std::sync::Mutex;

    pub fn critical_section<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        static LOCK: Mutex<()> = Mutex::new(());
        let _guard = LOCK.lock().unwrap();
        f()
    }

    pub fn in_thread_mode() -> bool {
        true
    }

    pub fn abort() -> ! {
        panic!("task queue accessed from interrupt context")
    }

    pub fn wait_for_event() {
        std::thread::yield_now();
    }
}
