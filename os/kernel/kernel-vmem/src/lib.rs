//! # Virtual Memory Support
//!
//! The architecture-neutral building blocks an address space is made of.
//!
//! ## What you get
//! - A [`RangeAllocator`] handing out free virtual intervals inside fixed
//!   bounds, lowest address first, merging on free.
//! - The [`Mmu`] trait: create and destroy page-table hierarchies, map, unmap
//!   reprotect and translate single 4 KiB pages with [`PteFlags`].
//! - The [`Processor`] trait: which hierarchy is loaded on this processor and
//!   how to pin the running context to it.
//! - [`PageFault`]: what the trap handler reports, decodable from an x86-64
//!   [`PageFaultCode`].
//!
//! ## Layering
//!
//! ```text
//!             AddressSpace (kernel-vmm)
//!               │            │
//!   RangeAllocator         Mmu ──────► FrameAllocator (kernel-alloc)
//!   (which VAs are free)   (what the hardware sees)
//! ```
//!
//! The range allocator knows nothing about page tables and the page tables
//! know nothing about which ranges are reserved; the address space keeps the
//! two consistent.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod fault;
pub mod mmu;
pub mod processor;
pub mod range_allocator;

pub use fault::{FaultAccess, FaultKind, PageFault, PageFaultCode};
pub use mmu::{MapError, Mmu, PageTableRoot, PteFlags, Translation};
pub use processor::Processor;
pub use range_allocator::{RangeAllocError, RangeAllocator};
