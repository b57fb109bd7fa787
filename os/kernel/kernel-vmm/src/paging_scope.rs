//! Temporarily switching the active page tables.
//!
//! Kernel code sometimes has to touch another space's user memory directly,
//! for instance to fill in a structure a process handed over. A
//! [`PagingScope`] loads that space's root for as long as it lives and puts
//! the previous root back when dropped. Scopes nest as a stack.

use crate::address_space::AddressSpace;
use core::marker::PhantomData;
use kernel_sync::{IrqGuard, PinGuard};
use kernel_vmem::{PageTableRoot, Processor};
use log::trace;

/// While alive, the processor translates through `space`'s root and the
/// running context stays on this processor.
#[must_use = "the previous page tables are restored when the scope is dropped"]
pub struct PagingScope<'a, P: Processor> {
    processor: &'a P,
    previous: PageTableRoot,
    installed: PageTableRoot,
    _space: PhantomData<&'a AddressSpace>,
    _pin: PinGuard<'a>,
}

impl<'a, P: Processor> PagingScope<'a, P> {
    pub fn enter(processor: &'a P, space: &'a AddressSpace) -> Self {
        let pin = processor.preempt().pin();
        let target = space.root();
        let previous = {
            let _irq = IrqGuard::new();
            let previous = processor.active_root();
            if previous != target {
                // SAFETY: the space outlives the scope, every root carries the
                // kernel half, and interrupts are off.
                unsafe { processor.install_root(target) };
            }
            previous
        };
        trace!("Entered {target:?} from {previous:?}");

        Self {
            processor,
            previous,
            installed: target,
            _space: PhantomData,
            _pin: pin,
        }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PageTableRoot {
        self.installed
    }

    #[inline]
    #[must_use]
    pub const fn previous_root(&self) -> PageTableRoot {
        self.previous
    }
}

impl<P: Processor> Drop for PagingScope<'_, P> {
    fn drop(&mut self) {
        let _irq = IrqGuard::new();
        let active = self.processor.active_root();
        debug_assert_eq!(
            active, self.installed,
            "paging scopes must be dropped in reverse order of entry"
        );
        if active != self.previous {
            // SAFETY: the previous root was active when this scope was
            // entered, and scopes unwind in stack order.
            unsafe { self.processor.install_root(self.previous) };
        }
        trace!("Left {:?} for {:?}", self.installed, self.previous);
    }
}
