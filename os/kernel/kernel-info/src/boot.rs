//! # Boot Memory Map

/// What the firmware reports a physical range is used for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    /// Free RAM the kernel may hand out.
    Usable,
    /// Firmware, MMIO, or otherwise off-limits.
    Reserved,
    /// ACPI tables; usable once parsed.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// RAM reported as faulty.
    BadMemory,
}

/// One entry of the firmware memory map.
///
/// Entries need not be page aligned; the frame allocator rounds usable ranges
/// inwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical start address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self { base, length, kind }
    }

    /// First byte past the entry, saturating at the top of the address space.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryKind::Usable)
    }
}
