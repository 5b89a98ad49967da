//! Synchronisation primitives.
//!
//! Two kinds of lock protect VM state:
//!
//! - [`SpinLock`]: a one-word atomic flag. Guards accesses that copy a
//!   single 16-byte `Value`, which cannot be read or written atomically.
//!   Hold times are a handful of instructions, so spinning beats parking.
//! - [`Section`]: a critical section for longer-held exclusions (the
//!   allocation path, per-type static constructors, the GC cycle), backed
//!   by `parking_lot`.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

/// A minimal test-and-set spin lock.
///
/// Not reentrant. Used for per-object field access and `StaticRef` cells.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn enter(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn leave(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Runs `f` while holding the lock.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter();
        let result = f();
        self.leave();
        result
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A critical section with explicit enter/leave and a `try_enter` fast
/// path, so callers can enter an unmanaged region before blocking on a
/// contended lock. Every `enter` (and successful `try_enter`) must be
/// paired with a `leave` on the same thread.
pub struct Section {
    raw: RawMutex,
}

impl Section {
    pub const fn new() -> Self {
        Self { raw: RawMutex::INIT }
    }

    #[inline]
    pub fn try_enter(&self) -> bool {
        self.raw.try_lock()
    }

    #[inline]
    pub fn enter(&self) {
        self.raw.lock()
    }

    #[inline]
    pub fn leave(&self) {
        unsafe { self.raw.unlock() }
    }
}

impl Default for Section {
    fn default() -> Self {
        Self::new()
    }
}
