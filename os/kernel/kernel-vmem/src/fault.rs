//! Page fault description.
//!
//! The trap handler turns whatever the hardware reports into a [`PageFault`]
//! and hands it to the memory core.

use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultKind {
    /// No translation exists for the page.
    NotPresent,
    /// A translation exists but does not permit the access.
    ProtectionViolation,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFault {
    address: VirtualAddress,
    kind: FaultKind,
    access: FaultAccess,
    user: bool,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, kind: FaultKind, access: FaultAccess) -> Self {
        Self {
            address,
            kind,
            access,
            user: false,
        }
    }

    #[must_use]
    pub const fn not_present(address: VirtualAddress, access: FaultAccess) -> Self {
        Self::new(address, FaultKind::NotPresent, access)
    }

    #[must_use]
    pub const fn protection(address: VirtualAddress, access: FaultAccess) -> Self {
        Self::new(address, FaultKind::ProtectionViolation, access)
    }

    /// Marks the fault as raised by user-mode code.
    #[must_use]
    pub const fn from_user(mut self, user: bool) -> Self {
        self.user = user;
        self
    }

    /// Decodes an x86-64 `#PF` error code together with `CR2`.
    #[must_use]
    pub const fn from_code(address: VirtualAddress, code: PageFaultCode) -> Self {
        let kind = if code.present() {
            FaultKind::ProtectionViolation
        } else {
            FaultKind::NotPresent
        };
        let access = if code.instruction_fetch() {
            FaultAccess::Execute
        } else if code.write() {
            FaultAccess::Write
        } else {
            FaultAccess::Read
        };
        Self::new(address, kind, access).from_user(code.user())
    }

    #[inline]
    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        self.address
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn access(&self) -> FaultAccess {
        self.access
    }

    #[inline]
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self.access, FaultAccess::Write)
    }

    #[inline]
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.user
    }
}

/// Page-fault error code layout (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
pub struct PageFaultCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    #[bits(59)]
    __: u64,
}

impl PageFaultCode {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page"
        } else if self.instruction_fetch() {
            "Instruction fetch from a non-executable page"
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_user_write_protection_fault() {
        let code = PageFaultCode::from_bits(0b111);
        let fault = PageFault::from_code(VirtualAddress::new(0x80_1000), code);
        assert_eq!(fault.kind(), FaultKind::ProtectionViolation);
        assert_eq!(fault.access(), FaultAccess::Write);
        assert!(fault.is_user());
        assert_eq!(code.explain(), "Write access to protected page");
    }

    #[test]
    fn instruction_fetch_wins_over_write_bit() {
        let code = PageFaultCode::new().with_instruction_fetch(true);
        let fault = PageFault::from_code(VirtualAddress::new(0x1000), code);
        assert_eq!(fault.kind(), FaultKind::NotPresent);
        assert_eq!(fault.access(), FaultAccess::Execute);
        assert!(!fault.is_user());
    }
}
