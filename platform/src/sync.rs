//! Critical sections.
//!
//! There is no scheduler on this machine; the only thing that can take
//! the CPU away from the main path is a hardware interrupt. Mutual
//! exclusion therefore means masking interrupts, and the state that needs
//! it is small and known up front: the bounce-pool slot table, the
//! live-mapping arena, and the cache manager's deferred-flush record.
//! Each of those lives in an [`IrqCell`], and the only way in is a
//! bounded closure, so the masked window is exactly as long as the
//! access.
//!
//! Interrupt handlers never take these sections; they do their minimum
//! bookkeeping on plain atomics and leave real work to the main path.
//!
//! The flag primitives compile to CLI/STI/PUSHF on hardware builds.
//! Elsewhere a software flag stands in, so the save/restore paths run
//! under the host test harness.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

// ═══════════════════════════════════════════════════════════════════════════
// INTERRUPT FLAG
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), target_os = "none"))]
mod flag {
    /// IF bit of EFLAGS.
    #[inline]
    pub fn enabled() -> bool {
        let flags: usize;
        unsafe {
            core::arch::asm!(
                "pushf",
                "pop {}",
                out(reg) flags,
                options(nomem, preserves_flags)
            );
        }
        flags & (1 << 9) != 0
    }

    #[inline]
    pub fn mask() {
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
        }
    }

    #[inline]
    pub fn unmask() {
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(any(target_arch = "x86", target_arch = "x86_64"), target_os = "none")))]
mod flag {
    use core::sync::atomic::{AtomicBool, Ordering};

    /// Software IF for hosted builds.
    static SOFT_IF: AtomicBool = AtomicBool::new(true);

    pub fn enabled() -> bool {
        SOFT_IF.load(Ordering::SeqCst)
    }

    pub fn mask() {
        SOFT_IF.store(false, Ordering::SeqCst);
    }

    pub fn unmask() {
        SOFT_IF.store(true, Ordering::SeqCst);
    }
}

/// Current interrupt-flag state.
///
/// Diagnostic only; the driver never toggles the flag directly, it saves
/// and restores through [`critical_section`].
pub fn interrupts_enabled() -> bool {
    flag::enabled()
}

// ═══════════════════════════════════════════════════════════════════════════
// CRITICAL SECTION
// ═══════════════════════════════════════════════════════════════════════════

/// Puts the saved flag back when the section ends, early return or not.
struct Restore {
    reenable: bool,
}

impl Drop for Restore {
    fn drop(&mut self) {
        if self.reenable {
            flag::unmask();
        }
    }
}

/// Run `f` with maskable interrupts off, restoring the prior flag state
/// afterwards.
///
/// Nesting is fine: an inner section saves a masked flag and restores a
/// masked flag. Keep the closure short; every microsecond in here is a
/// microsecond of receive latency.
pub fn critical_section<R>(f: impl FnOnce() -> R) -> R {
    let restore = Restore { reenable: flag::enabled() };
    flag::mask();
    let result = f();
    drop(restore);
    result
}

// ═══════════════════════════════════════════════════════════════════════════
// IRQ CELL
// ═══════════════════════════════════════════════════════════════════════════

/// Interrupt-shared mutable state.
///
/// [`IrqCell::with`] is the only access path: the closure runs inside a
/// critical section with exclusive use of the value. On the single-CPU
/// target the mask alone is the lock; the busy bit covers hosted test
/// harnesses, where OS threads stand in for interrupt interleavings.
pub struct IrqCell<T> {
    busy: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: `value` is only reachable from `with`, which masks interrupts
// and owns the busy bit for the closure's duration.
unsafe impl<T: Send> Send for IrqCell<T> {}
unsafe impl<T: Send> Sync for IrqCell<T> {}

/// Clears the busy bit when the access ends, panic or not.
struct ReleaseBusy<'a>(&'a AtomicBool);

impl Drop for ReleaseBusy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> IrqCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Run `f` on the protected value inside a critical section.
    ///
    /// Do not nest `with` on the same cell: with interrupts masked there
    /// is nobody left to release the busy bit.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section(|| {
            while self.busy.swap(true, Ordering::Acquire) {
                core::hint::spin_loop();
            }
            let release = ReleaseBusy(&self.busy);
            // Safety: interrupts are masked and the busy bit is held, so
            // no other reference to `value` can be live.
            let result = f(unsafe { &mut *self.value.get() });
            drop(release);
            result
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    /// The software IF is process-global; serialize the tests that read it.
    fn serial() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_section_masks_and_restores() {
        let _serial = serial();
        assert!(interrupts_enabled());
        critical_section(|| {
            assert!(!interrupts_enabled());
        });
        assert!(interrupts_enabled());
    }

    #[test]
    fn test_nested_sections_stay_masked() {
        let _serial = serial();
        critical_section(|| {
            critical_section(|| {
                assert!(!interrupts_enabled());
            });
            // The inner section saved a masked flag; it must not unmask
            assert!(!interrupts_enabled());
        });
        assert!(interrupts_enabled());
    }

    #[test]
    fn test_cell_gives_exclusive_mutable_access() {
        let _serial = serial();
        let cell = IrqCell::new(41u32);
        cell.with(|v| *v += 1);
        assert_eq!(cell.with(|v| *v), 42);
    }

    #[test]
    fn test_cell_access_runs_masked() {
        let _serial = serial();
        let cell = IrqCell::new(());
        cell.with(|_| assert!(!interrupts_enabled()));
        assert!(interrupts_enabled());
    }

    #[test]
    fn test_cell_survives_a_panicking_closure() {
        let _serial = serial();
        let cell = IrqCell::new(7u8);
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cell.with(|_| panic!("mid-section"));
        }));
        assert!(caught.is_err());
        // Busy bit and interrupt flag both released by the drop guards
        assert!(interrupts_enabled());
        assert_eq!(cell.with(|v| *v), 7);
    }
}
