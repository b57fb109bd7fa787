//! The kernel's memory context.

use crate::address_space::AddressSpace;
use crate::error::VmError;
use crate::inode::{Inode, InodeId};
use crate::memory_object::{InodeSharing, MemoryObject};
use crate::paging_scope::PagingScope;
use crate::region::PageFaultResponse;
use crate::typed_mapping::TypedMapping;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use kernel_alloc::{FrameAllocator, PhysMapper};
use kernel_info::memory::{KERNEL_VM_BASE, KERNEL_VM_END, USER_RANGE_BASE, USER_RANGE_END};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_sync::SpinLock;
use kernel_vmem::{Mmu, PageFault, Processor};
use log::{debug, info};

/// Everything the memory core needs from the machine.
pub trait Platform: PhysMapper + Mmu + Processor + Sync {}

impl<T: PhysMapper + Mmu + Processor + Sync> Platform for T {}

/// Owns physical memory, the kernel address space and the shared inode
/// objects. Passed by reference to everything that maps memory.
pub struct Vmm<P: Platform> {
    platform: P,
    frames: FrameAllocator,
    kernel_space: AddressSpace,
    shared_inodes: SpinLock<BTreeMap<InodeId, Weak<MemoryObject>>>,
}

impl<P: Platform> Vmm<P> {
    /// Adopts the hierarchy the processor runs on as the kernel space.
    #[must_use]
    pub fn new(platform: P, frames: FrameAllocator) -> Self {
        let root = platform.active_root();
        let kernel_space = AddressSpace::with_root(root, kernel_window(), false);
        info!(
            "Memory core up: {} of {} pages free, kernel space {root:?} over {}",
            frames.free_pages(),
            frames.total_pages(),
            kernel_window()
        );
        Self {
            platform,
            frames,
            kernel_space,
            shared_inodes: SpinLock::new(BTreeMap::new()),
        }
    }

    #[inline]
    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    #[inline]
    #[must_use]
    pub const fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    /// A user address space with its own page tables.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the root table could not be allocated.
    pub fn create_address_space(&self) -> Result<AddressSpace, VmError> {
        AddressSpace::new(self, user_window(), true)
    }

    /// The one shared object of `inode`, created on first use.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for an empty file.
    pub fn shared_inode_object(&self, inode: Arc<dyn Inode>) -> Result<Arc<MemoryObject>, VmError> {
        let mut objects = self.shared_inodes.lock();
        if let Some(object) = objects.get(&inode.id()).and_then(Weak::upgrade) {
            return Ok(object);
        }

        objects.retain(|_, object| object.strong_count() > 0);
        let id = inode.id();
        let object = MemoryObject::inode_backed(inode, InodeSharing::Shared)?;
        objects.insert(id, Arc::downgrade(&object));
        debug!("Shared object for inode {id} created");
        Ok(object)
    }

    /// A fresh private object of `inode`.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for an empty file.
    pub fn private_inode_object(&self, inode: Arc<dyn Inode>) -> Result<Arc<MemoryObject>, VmError> {
        MemoryObject::inode_backed(inode, InodeSharing::Private)
    }

    /// Trap handler entry.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] or [`VmError::Io`] while resolving.
    pub fn handle_page_fault(&self, space: &AddressSpace, fault: PageFault) -> Result<PageFaultResponse, VmError> {
        space.handle_fault(self, fault)
    }

    /// Switches this processor to `space` until the scope is dropped.
    pub fn enter<'a>(&'a self, space: &'a AddressSpace) -> PagingScope<'a, P> {
        PagingScope::enter(&self.platform, space)
    }

    /// Maps a `T` at `pa` read-only into the kernel space.
    ///
    /// # Errors
    /// See [`TypedMapping::map_readonly`].
    pub fn map_typed<T>(&self, pa: PhysicalAddress) -> Result<TypedMapping<'_, T, P>, VmError> {
        TypedMapping::map_readonly(self, &self.kernel_space, pa)
    }

    /// Maps a `T` at `pa` writable into the kernel space.
    ///
    /// # Errors
    /// See [`TypedMapping::map_writable`].
    pub fn map_typed_mut<T>(&self, pa: PhysicalAddress) -> Result<TypedMapping<'_, T, P>, VmError> {
        TypedMapping::map_writable(self, &self.kernel_space, pa)
    }
}

fn kernel_window() -> VirtualRange {
    window(KERNEL_VM_BASE, KERNEL_VM_END)
}

fn user_window() -> VirtualRange {
    window(USER_RANGE_BASE, USER_RANGE_END)
}

fn window(base: u64, end: u64) -> VirtualRange {
    VirtualRange::new(VirtualAddress::new(base), end - base)
}
