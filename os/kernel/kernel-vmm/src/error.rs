use crate::inode::IoError;
use kernel_alloc::OutOfMemory;
use kernel_memory_addresses::{VirtualAddress, VirtualRange};
use kernel_vmem::{MapError, RangeAllocError};

/// Errors of the virtual memory core.
///
/// `OutOfMemory` and `NoSpace` are recoverable at the call site that asked
/// for memory. `Io` aborts only the access that triggered it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("no free virtual range is large enough")]
    NoSpace,
    #[error("{0} overlaps an existing region")]
    Overlap(VirtualRange),
    #[error("{0} conflicts with an existing allocation")]
    Conflict(VirtualRange),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("access to {0} violates region permissions")]
    Segfault(VirtualAddress),
    #[error("range is empty, misaligned or outside the address space")]
    InvalidRange,
    #[error("region does not fit its memory object")]
    InvalidRegion,
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    /// The page tables hold a leaf no region accounts for.
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
}

impl From<OutOfMemory> for VmError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

impl From<MapError> for VmError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::AlreadyMapped(va) => Self::AlreadyMapped(va),
        }
    }
}

impl From<RangeAllocError> for VmError {
    fn from(e: RangeAllocError) -> Self {
        match e {
            RangeAllocError::NoSpace => Self::NoSpace,
            RangeAllocError::Conflict(range) => Self::Conflict(range),
            RangeAllocError::OutOfBounds(_) | RangeAllocError::InvalidSize => Self::InvalidRange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PAGE_SIZE;

    #[test]
    fn range_errors_map_onto_vm_errors() {
        let range = VirtualRange::new(VirtualAddress::new(0x1000), PAGE_SIZE);
        assert_eq!(VmError::from(RangeAllocError::NoSpace), VmError::NoSpace);
        assert_eq!(VmError::from(RangeAllocError::Conflict(range)), VmError::Conflict(range));
        assert_eq!(VmError::from(RangeAllocError::OutOfBounds(range)), VmError::InvalidRange);
        assert_eq!(VmError::from(RangeAllocError::InvalidSize), VmError::InvalidRange);
        assert_eq!(VmError::from(OutOfMemory), VmError::OutOfMemory);
    }

    #[test]
    fn map_errors_map_onto_vm_errors() {
        let va = VirtualAddress::new(0x1000);
        assert_eq!(VmError::from(MapError::OutOfMemory), VmError::OutOfMemory);
        assert_eq!(VmError::from(MapError::AlreadyMapped(va)), VmError::AlreadyMapped(va));
    }
}
