//! The per-processor seam: which hierarchy is loaded, and whether the running
//! context may migrate.

use crate::mmu::PageTableRoot;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::PreemptCounter;

pub trait Processor {
    /// The hierarchy this processor currently translates through.
    fn active_root(&self) -> PageTableRoot;

    /// Loads `root` on this processor.
    ///
    /// # Safety
    /// `root` must be a live hierarchy that maps the running kernel code and
    /// stack, and interrupts must be disabled.
    unsafe fn install_root(&self, root: PageTableRoot);

    /// Migration pinning for this processor.
    fn preempt(&self) -> &PreemptCounter;

    /// A pointer through which kernel code can reach the mapped address `va`
    /// in the active hierarchy.
    fn pointer_to(&self, va: VirtualAddress) -> *mut u8 {
        va.as_mut_ptr()
    }
}
