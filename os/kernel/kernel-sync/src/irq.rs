//! Interrupt masking.
//!
//! On the bare-metal x86-64 target the interrupt flag is read with
//! `pushfq/pop` and toggled with `cli`/`sti`. Everywhere else (host builds,
//! unit tests) a process-wide emulated flag stands in for `RFLAGS.IF`, so code
//! that masks interrupts around a critical section runs unchanged.

use crate::{Mutex, MutexGuard, RawLock, RawUnlock};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    const RFLAGS_IF: u64 = 1 << 9;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r & RFLAGS_IF != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn interrupts_enabled() -> bool {
        ENABLED.load(Ordering::Acquire)
    }

    #[inline]
    pub fn disable() {
        ENABLED.store(false, Ordering::Release);
    }

    #[inline]
    pub fn enable() {
        ENABLED.store(true, Ordering::Release);
    }
}

/// Whether interrupts are currently enabled on this processor.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::interrupts_enabled()
}

/// A mutex guard that also disables interrupts while held.
///
/// Created via [`Mutex::lock_irq`]: saves the interrupt state and disables
/// interrupts, then acquires the mutex. Dropping releases the mutex first and
/// restores interrupts second.
///
/// Needed for any lock that may also be taken from interrupt context (a
/// driver dropping its last reference to a DMA frame, say); otherwise the
/// handler could spin on a lock its own processor holds.
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock> {
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> core::ops::Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock + RawUnlock> core::ops::DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T, R> {
        let ig = IrqGuard::new();
        let g = self.lock();
        IrqMutex { guard: g, _irq: ig }
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the interrupt flag. If interrupts were enabled
/// it disables them; on drop it re-enables them **only** if they were enabled
/// before, so guards nest.
///
/// ```
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// {
///     let _outer = IrqGuard::new();
///     assert!(!interrupts_enabled());
///     {
///         let _inner = IrqGuard::new();
///     }
///     // the inner guard did not re-enable
///     assert!(!interrupts_enabled());
/// }
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = arch::interrupts_enabled();
        if enabled {
            arch::disable();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether dropping this guard will re-enable interrupts.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}
