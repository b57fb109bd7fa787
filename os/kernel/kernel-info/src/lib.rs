//! # Kernel Memory Configuration
//!
//! Compile-time memory layout and the boot memory map vocabulary shared by the
//! physical frame allocator and the virtual memory core.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **User range**: `[USER_RANGE_BASE, USER_RANGE_END)`, the bounds every
//!   process address space allocates virtual ranges from
//! * **Kernel VM window**: `[KERNEL_VM_BASE, KERNEL_VM_END)`, where the kernel
//!   places temporary typed mappings and staging buffers
//! * **HHDM**: the direct map used to touch physical memory
//! * **Low memory**: the boundary below which frames form the low-memory zone
//!
//! ### Boot Memory Map ([`boot`])
//! * [`boot::MemoryMapEntry`]: one firmware-reported physical range
//! * [`boot::MemoryKind`]: what the firmware says the range is used for
//!
//! The layout is checked at compile time: the ranges are page aligned, the
//! user range sits entirely below the kernel window, and the kernel window does
//! not overlap the direct map.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
