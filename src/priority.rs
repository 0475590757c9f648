//! Type-level representation of execution context.
//!
//! These are zero-sized tokens. The top-level glue hands an `Isr` token to
//! the three interrupt handlers and a `Thread` token to the foreground loop;
//! APIs that are only safe to call from one context or the other require the
//! matching token as a parameter, turning the concurrency contract in the
//! design notes ("only from ISR", "only from foreground") into something the
//! type checker enforces rather than a comment.

use core::marker::PhantomData;

// Marker type used to cause things to stop being Sync/Send.
type NotSyncOrSend = PhantomData<*mut ()>;

/// Proof that the caller is executing inside an interrupt handler.
#[derive(Copy, Clone)]
pub struct Isr(NotSyncOrSend);

/// Proof that the caller is executing in thread (foreground) mode, outside
/// any interrupt handler.
#[derive(Copy, Clone)]
pub struct Thread(NotSyncOrSend);

impl Isr {
    /// # Safety
    /// Caller must actually be running in interrupt context.
    pub unsafe fn new() -> Self {
        Isr(PhantomData)
    }
}

impl Thread {
    /// # Safety
    /// Caller must actually be running in thread mode.
    pub unsafe fn new() -> Self {
        Thread(PhantomData)
    }

    /// Returns a `Thread` token only if called from thread priority, by
    /// inspecting the active exception number in `ICSR`.
    #[cfg(target_os = "none")]
    pub fn new_checked() -> Option<Self> {
        // Safety: reads of the ICSR are always safe.
        let icsr = unsafe { &*cortex_m::peripheral::SCB::PTR }.icsr.read();
        if icsr & 0xFF == 0 {
            Some(unsafe { Self::new() })
        } else {
            None
        }
    }
}
