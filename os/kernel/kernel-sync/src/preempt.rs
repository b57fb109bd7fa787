//! Per-processor migration pinning.
//!
//! Each processor owns one [`PreemptCounter`]. Code that relies on
//! per-processor state surviving across several steps (the active page-table
//! root, for instance) takes a [`PinGuard`]; while any guard is alive the
//! scheduler must neither migrate the running context to another processor
//! nor switch to another process. Guards nest.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct PreemptCounter {
    depth: AtomicUsize,
}

impl PreemptCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
        }
    }

    /// Pins the running context until the returned guard is dropped.
    #[inline]
    #[must_use = "the context is unpinned as soon as the guard is dropped"]
    pub fn pin(&self) -> PinGuard<'_> {
        self.depth.fetch_add(1, Ordering::Acquire);
        PinGuard {
            counter: self,
            _not_send: PhantomData,
        }
    }

    /// Current nesting depth.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Consulted by the scheduler before migrating or switching away.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.depth() != 0
    }
}

/// Keeps the running context on its processor. Not `Send`.
pub struct PinGuard<'a> {
    counter: &'a PreemptCounter,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        let prev = self.counter.depth.fetch_sub(1, Ordering::Release);
        assert_ne!(prev, 0, "preempt counter underflow");
    }
}
