mod common;

use common::{TestInode, user_va, vmm};
use kernel_info::memory::{USER_RANGE_BASE, USER_RANGE_END};
use kernel_vmem::Processor;
use kernel_vmm::{Access, VmError};
use std::sync::Arc;

#[test]
fn the_kernel_space_runs_on_the_boot_root() {
    let vmm = vmm(8);
    assert_eq!(vmm.kernel_space().root(), vmm.platform().active_root());
    assert!(!vmm.kernel_space().is_user());
}

#[test]
fn user_spaces_cover_the_user_window() {
    let vmm = vmm(8);
    let space = vmm.create_address_space().unwrap();
    assert!(space.is_user());
    assert_ne!(space.root(), vmm.kernel_space().root());
    assert_eq!(space.bounds().base(), user_va(0));
    assert_eq!(space.bounds().size(), USER_RANGE_END - USER_RANGE_BASE);
    space.destroy(&vmm).unwrap();
}

#[test]
fn shared_objects_are_cached_while_someone_holds_them() {
    let vmm = vmm(8);
    let inode = TestInode::patterned(30, 4096);
    let first = vmm.shared_inode_object(inode.clone()).unwrap();
    let again = vmm.shared_inode_object(inode.clone()).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    let private = vmm.private_inode_object(inode.clone()).unwrap();
    assert!(!Arc::ptr_eq(&first, &private));

    let weak = Arc::downgrade(&first);
    drop(first);
    drop(again);
    assert!(weak.upgrade().is_none());
    let fresh = vmm.shared_inode_object(inode).unwrap();
    assert!(fresh.is_shared());
    assert_eq!(fresh.resident_pages(), 0);
}

#[test]
fn empty_files_cannot_be_mapped() {
    let vmm = vmm(8);
    let empty = TestInode::new(31, Vec::new());
    assert!(matches!(vmm.shared_inode_object(empty.clone()), Err(VmError::InvalidRange)));
    assert!(matches!(vmm.private_inode_object(empty), Err(VmError::InvalidRange)));
}

#[test]
fn user_regions_are_mapped_for_user_mode() {
    let vmm = vmm(8);
    let space = vmm.create_address_space().unwrap();
    let object = kernel_vmm::MemoryObject::anonymous(4096).unwrap();
    let range = space
        .allocate_region(&vmm, None, 4096, object, 0, Access::READ_EXECUTE)
        .unwrap();
    let mut byte = [0; 1];
    space.read_bytes(&vmm, range.base(), &mut byte).unwrap();
    let flags = kernel_vmem::Mmu::translate(vmm.platform(), space.root(), range.base())
        .unwrap()
        .flags;
    assert!(flags.user() && flags.executable() && !flags.writable());
    space.destroy(&vmm).unwrap();
}
