//! # Physical Memory Management
//!
//! Owns physical RAM for the kernel: who may use which page, for how long, and
//! how kernel code gets at a page's bytes.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               FrameAllocator                        │
//! │    • zones in preference order (low memory last)    │
//! │    • single, contiguous and permanent allocations   │
//! │    • commitments that keep pages free for later     │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ one lock per zone
//! ┌─────────────────▼───────────────────────────────────┐
//! │               PhysicalZone                          │
//! │    • [lower, upper) of usable RAM                   │
//! │    • bitmap free index, lowest-free first fit       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ Arc handle, returned on last drop
//! ┌─────────────────▼───────────────────────────────────┐
//! │               PhysicalFrame                         │
//! │    • shared ownership of one 4 KiB page             │
//! │    • exempt frames are never returned               │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Page contents are reached through a [`PhysMapper`]: the running kernel
//! uses [`HhdmPhysMapper`](phys_mapper::HhdmPhysMapper), tests supply a mapper
//! over host memory.
//!
//! ## Example
//!
//! ```rust
//! use kernel_alloc::{FrameAllocator, FramePolicy, PhysicalZone, ZoneKind};
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let mut frames = FrameAllocator::new();
//! frames.add_zone(PhysicalZone::new(
//!     ZoneKind::Normal,
//!     PhysicalAddress::new(0x0100_0000),
//!     PhysicalAddress::new(0x0100_4000),
//! ));
//!
//! let frame = frames.allocate(FramePolicy::Any).unwrap();
//! assert_eq!(frames.free_pages(), 3);
//! drop(frame);
//! assert_eq!(frames.free_pages(), 4);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod bitmap;
pub mod frame;
pub mod frame_alloc;
pub mod phys_mapper;
pub mod zone;

pub use bitmap::Bitmap;
pub use frame::{FRAME_BYTES, FrameBytes, PhysicalFrame};
pub use frame_alloc::{CommittedFrames, FrameAllocator, FramePolicy, OutOfMemory};
pub use phys_mapper::PhysMapper;
pub use zone::{PhysicalZone, ZoneKind};
