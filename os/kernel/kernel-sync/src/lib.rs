//! # Kernel synchronization primitives
//!
//! * [`SpinLock`]: test-and-test-and-set lock for short critical sections.
//! * [`TicketMutex`]: FIFO-fair lock built from [`Mutex`] and [`RawTicket`].
//! * [`IrqGuard`]: save, disable and restore the interrupt flag.
//! * [`PreemptCounter`]: per-processor migration pinning.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
pub mod preempt;
mod raw_ticket;
mod spin_lock;

pub use irq::{IrqGuard, IrqMutex};
pub use mutex::{Mutex, MutexGuard};
pub use preempt::{PinGuard, PreemptCounter};
pub use raw_ticket::RawTicket;
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};

pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must hold the lock.
    unsafe fn raw_unlock(&self);
}
