mod common;

use common::{PAGE, vmm};
use kernel_alloc::PhysMapper;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::Mmu;
use kernel_vmm::{PhysicalRingBuffer, VmError};

fn device_read<const N: usize>(vmm: &kernel_vmm::Vmm<common::TestMachine>, pa: PhysicalAddress) -> [u8; N] {
    // SAFETY: the buffer's frames are test RAM and nothing writes concurrently.
    unsafe { *vmm.platform().phys_to_mut::<[u8; N]>(pa) }
}

#[test]
fn chunks_are_contiguous_and_reclaimed_in_order() {
    let vmm = vmm(16);
    let ring = PhysicalRingBuffer::new(&vmm, 8192).unwrap();
    assert_eq!(ring.capacity(), 8192);
    assert_eq!(vmm.frames().free_pages(), 14);

    let (first, len) = ring.write(&[1; 5000]).unwrap();
    assert_eq!(len, 5000);
    assert_eq!(first, ring.start_of_used());
    let (second, len) = ring.write(&[2; 5000]).unwrap();
    assert_eq!(second, first + 5000);
    assert_eq!(len, 3192);
    assert_eq!(ring.write(&[3]), None);
    assert_eq!(ring.used_bytes(), 8192);
    assert_eq!(device_read::<4>(&vmm, second), [2; 4]);

    ring.reclaim(first, 5000);
    assert_eq!(ring.start_of_used(), second);

    // The free space now starts at the beginning of the buffer.
    let (third, len) = ring.write(&[3; 6000]).unwrap();
    assert_eq!(third, first);
    assert_eq!(len, 5000);
    assert_eq!(device_read::<4>(&vmm, first + 4996), [3; 4]);

    let mut out = [0; 10];
    assert_eq!(ring.read(&mut out), 10);
    assert_eq!(out, [2; 10]);

    ring.reclaim(second, 3192);
    assert_eq!(ring.start_of_used(), first);
    assert_eq!(ring.used_bytes(), 5000);
}

#[test]
fn writes_stop_at_the_wrap_point() {
    let vmm = vmm(8);
    let ring = PhysicalRingBuffer::new(&vmm, 100).unwrap();
    let (base, len) = ring.write(&[0; 60]).unwrap();
    assert_eq!(len, 60);
    ring.reclaim(base, 60);

    assert_eq!(ring.write(&[1; 70]), Some((base + 60, 40)));
    assert_eq!(ring.write(&[2; 70]), Some((base, 60)));
    assert_eq!(ring.write(&[3; 1]), None);

    let mut out = [0; 70];
    assert_eq!(ring.read(&mut out), 40);
    assert_eq!(out[..40], [1; 40]);
}

#[test]
#[should_panic(expected = "order they were written")]
fn reclaiming_out_of_order_panics() {
    let vmm = vmm(8);
    let ring = PhysicalRingBuffer::new(&vmm, 4096).unwrap();
    ring.write(&[1; 10]).unwrap();
    let (second, len) = ring.write(&[2; 10]).unwrap();
    ring.reclaim(second, len);
}

#[test]
#[should_panic(expected = "in use")]
fn reclaiming_more_than_is_used_panics() {
    let vmm = vmm(8);
    let ring = PhysicalRingBuffer::new(&vmm, 4096).unwrap();
    let (first, _) = ring.write(&[1; 10]).unwrap();
    ring.reclaim(first, 11);
}

#[test]
fn dropping_the_buffer_unmaps_and_frees_it() {
    let vmm = vmm(8);
    assert!(matches!(PhysicalRingBuffer::new(&vmm, 0), Err(VmError::InvalidRange)));

    let ring = PhysicalRingBuffer::new(&vmm, 3 * 4096).unwrap();
    let mapping = ring.mapping();
    assert_eq!(mapping.size(), 3 * PAGE);
    let kernel_root = vmm.kernel_space().root();
    assert!(vmm.platform().translate(kernel_root, mapping.base()).is_some());
    assert_eq!(vmm.frames().free_pages(), 5);

    drop(ring);
    assert_eq!(vmm.frames().free_pages(), 8);
    assert!(vmm.platform().translate(kernel_root, mapping.base()).is_none());
    assert_eq!(vmm.kernel_space().region_count(), 0);
}
