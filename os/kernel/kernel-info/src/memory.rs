//! # Memory Layout

/// Lowest virtual address handed out to user space.
///
/// The first 8 MiB stay unmapped so that null-ish pointers always fault.
pub const USER_RANGE_BASE: u64 = 0x0000_0000_0080_0000;

/// End (exclusive) of the allocatable user range.
pub const USER_RANGE_END: u64 = 0x0000_7fff_ffff_f000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the kernel window for temporary mappings and staging buffers.
pub const KERNEL_VM_BASE: u64 = 0xffff_c000_0000_0000;

/// End (exclusive) of the kernel mapping window (512 GiB).
pub const KERNEL_VM_END: u64 = 0xffff_c080_0000_0000;

/// Physical frames below this boundary form the low-memory zone
/// (legacy DMA); they are handed out last.
pub const LOW_MEMORY_LIMIT: u64 = 16 * 1024 * 1024;

const PAGE_MASK: u64 = 0xfff;

const _: () = {
    assert!(USER_RANGE_BASE & PAGE_MASK == 0);
    assert!(USER_RANGE_END & PAGE_MASK == 0);
    assert!(KERNEL_VM_BASE & PAGE_MASK == 0);
    assert!(KERNEL_VM_END & PAGE_MASK == 0);
    assert!(LOW_MEMORY_LIMIT & PAGE_MASK == 0);
    assert!(USER_RANGE_BASE < USER_RANGE_END);
    assert!(USER_RANGE_END < HHDM_BASE);
    assert!(KERNEL_VM_BASE > HHDM_BASE);
    assert!(KERNEL_VM_BASE < KERNEL_VM_END);
};
