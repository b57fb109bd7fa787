//! # Virtual Memory Manager
//!
//! Address spaces, the regions mapped into them and the memory objects
//! behind those regions, with demand paging, copy-on-write and dirty
//! tracking for file-backed pages.
//!
//! ```text
//!  Vmm ──┬── FrameAllocator            (physical pages)
//!        ├── kernel AddressSpace       (KERNEL_VM_BASE..KERNEL_VM_END)
//!        └── shared inode objects      (one per inode, weakly held)
//!
//!  AddressSpace ── root + RegionSet ── Region ── Arc<MemoryObject> ── frames
//! ```
//!
//! Everything is reached through an explicit [`Vmm`] context that owns the
//! [`Platform`]: page tables, the per-processor root and a way to reach
//! physical memory.
//!
//! ## Faults
//!
//! [`Vmm::handle_page_fault`] finds the region under the faulting address
//! and lets it decide:
//!
//! - not present: page in (zero fill, or read from the inode), map;
//! - write to a copy-on-write page: copy unless this object is the last
//!   holder of the frame, then map writable;
//! - first write to a clean inode page: mark dirty, map writable;
//! - anything the region does not permit: [`PageFaultResponse::SignalSegfault`].
//!
//! ## Locking
//!
//! Address space lock, then the object's mapping list, then memory object
//! lock, then zone lock. Faults hold the address space lock while they
//! resolve; inode reads drop the object lock around the I/O.
//!
//! Write-back clears a page's dirty bit only after write-protecting it in
//! every mapping on the object's list, so a store made after a flush always
//! faults and marks the page dirty again.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod address_space;
mod error;
mod inode;
pub mod memory_object;
mod paging_scope;
mod region;
mod ring_buffer;
mod typed_mapping;
mod vmm;

pub use address_space::{AddressSpace, RegionSet};
pub use error::VmError;
pub use inode::{Inode, InodeId, IoError};
pub use memory_object::{AllocationStrategy, InodeSharing, MemoryObject};
pub use paging_scope::PagingScope;
pub use region::{Access, ObjectPage, PageFaultResponse, Region};
pub use ring_buffer::PhysicalRingBuffer;
pub use typed_mapping::TypedMapping;
pub use vmm::{Platform, Vmm};
