use kernel_alloc::{
    FRAME_BYTES, FrameAllocator, FramePolicy, OutOfMemory, PhysMapper, PhysicalFrame,
    PhysicalZone, ZoneKind,
};
use kernel_info::boot::{MemoryKind, MemoryMapEntry};
use kernel_info::memory::LOW_MEMORY_LIMIT;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use std::cell::UnsafeCell;

const LOW_BASE: u64 = 0x0010_0000;
const NORMAL_BASE: u64 = LOW_MEMORY_LIMIT;

/// A 4 KiB-aligned raw frame standing in for physical RAM.
#[repr(align(4096))]
struct Aligned4K(UnsafeCell<[u8; FRAME_BYTES]>);

/// "RAM" made of page-aligned host buffers starting at a physical base.
struct TestPhys {
    base: u64,
    frames: Vec<Aligned4K>,
}

impl TestPhys {
    fn new(base: u64, pages: usize) -> Self {
        Self {
            base,
            frames: (0..pages)
                .map(|_| Aligned4K(UnsafeCell::new([0xAA; FRAME_BYTES])))
                .collect(),
        }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let index = ((pa.as_u64() - self.base) / PAGE_SIZE) as usize;
        let offset = (pa.as_u64() % PAGE_SIZE) as usize;
        let page = self.frames[index].0.get().cast::<u8>();
        unsafe { &mut *page.add(offset).cast::<T>() }
    }
}

fn two_zone_allocator() -> FrameAllocator {
    let mut frames = FrameAllocator::new();
    frames.add_zone(PhysicalZone::new(
        ZoneKind::Low,
        PhysicalAddress::new(LOW_BASE),
        PhysicalAddress::new(LOW_BASE + 4 * PAGE_SIZE),
    ));
    frames.add_zone(PhysicalZone::new(
        ZoneKind::Normal,
        PhysicalAddress::new(NORMAL_BASE),
        PhysicalAddress::new(NORMAL_BASE + 4 * PAGE_SIZE),
    ));
    frames
}

#[test]
fn low_memory_zone_is_used_last() {
    let frames = two_zone_allocator();
    assert_eq!(frames.zones()[0].kind(), ZoneKind::Normal);

    let held: Vec<_> = (0..4)
        .map(|_| frames.allocate(FramePolicy::Any).unwrap())
        .collect();
    assert!(held.iter().all(|f| f.address().as_u64() >= NORMAL_BASE));

    let spill = frames.allocate(FramePolicy::Any).unwrap();
    assert_eq!(spill.address().as_u64(), LOW_BASE);
}

#[test]
fn low_memory_policy_never_touches_normal_zones() {
    let frames = two_zone_allocator();
    let held: Vec<_> = (0..4)
        .map(|_| frames.allocate(FramePolicy::LowMemory).unwrap())
        .collect();
    assert!(held.iter().all(|f| f.address().as_u64() < LOW_MEMORY_LIMIT));
    assert_eq!(frames.allocate(FramePolicy::LowMemory).unwrap_err(), OutOfMemory);
    assert!(frames.allocate(FramePolicy::Any).is_ok());
}

#[test]
fn dropping_last_reference_makes_frame_reusable() {
    let frames = two_zone_allocator();
    let frame = frames.allocate(FramePolicy::Any).unwrap();
    let address = frame.address();

    let second_owner = frame.clone();
    assert_eq!(frame.ref_count(), 2);
    drop(frame);
    assert_eq!(second_owner.ref_count(), 1);
    assert_eq!(frames.free_pages(), 7);

    drop(second_owner);
    assert_eq!(frames.free_pages(), 8);
    assert_eq!(frames.allocate(FramePolicy::Any).unwrap().address(), address);
}

#[test]
fn exhaustion_is_reported_not_fatal() {
    let frames = two_zone_allocator();
    let held: Vec<_> = (0..8)
        .map(|_| frames.allocate(FramePolicy::Any).unwrap())
        .collect();
    assert_eq!(frames.allocate(FramePolicy::Any).unwrap_err(), OutOfMemory);
    drop(held);
    assert_eq!(frames.free_pages(), 8);
}

#[test]
fn contiguous_allocation_is_atomic() {
    let frames = two_zone_allocator();
    // Fragment the normal zone: take pages 0 and 2.
    let a = frames.allocate(FramePolicy::Any).unwrap();
    let b = frames.allocate(FramePolicy::Any).unwrap();
    let c = frames.allocate(FramePolicy::Any).unwrap();
    drop(b);
    let free_before = frames.free_pages();

    // Only the low zone still has four consecutive pages.
    let run = frames.allocate_contiguous(4, FramePolicy::Any).unwrap();
    assert_eq!(run.len(), 4);
    for (i, frame) in run.iter().enumerate() {
        assert_eq!(frame.address().as_u64(), LOW_BASE + i as u64 * PAGE_SIZE);
    }

    // No zone has two free pages in a row any more; a failed request reserves nothing.
    let free_after_run = frames.free_pages();
    assert_eq!(free_after_run, free_before - 4);
    assert_eq!(
        frames.allocate_contiguous(2, FramePolicy::Any).unwrap_err(),
        OutOfMemory
    );
    assert_eq!(frames.free_pages(), free_after_run);
    drop((a, c));
}

#[test]
fn permanent_frames_never_return() {
    let frames = two_zone_allocator();
    let frame = frames.allocate_permanent(FramePolicy::Any).unwrap();
    assert!(frame.is_exempt_from_free_list());
    let address = frame.address();
    drop(frame);
    assert_eq!(frames.free_pages(), 7);
    assert_ne!(frames.allocate(FramePolicy::Any).unwrap().address(), address);
}

#[test]
fn wrapped_frames_do_not_touch_zones() {
    let frames = two_zone_allocator();
    let mmio = PhysicalFrame::wrap_existing(PhysicalAddress::new(0xFEE0_0000));
    assert!(mmio.is_exempt_from_free_list());
    drop(mmio);
    assert_eq!(frames.free_pages(), 8);
}

#[test]
fn zeroed_and_copied_contents() {
    let ram = TestPhys::new(NORMAL_BASE, 4);
    let mut frames = FrameAllocator::new();
    frames.add_zone(PhysicalZone::new(
        ZoneKind::Normal,
        PhysicalAddress::new(NORMAL_BASE),
        PhysicalAddress::new(NORMAL_BASE + 4 * PAGE_SIZE),
    ));

    let source = frames.allocate_zeroed(FramePolicy::Any, &ram).unwrap();
    source.with_bytes(&ram, |bytes| assert!(bytes.iter().all(|&b| b == 0)));
    source.write_bytes(&ram, 100, b"frame");

    let copy = frames.allocate(FramePolicy::Any).unwrap();
    copy.copy_from(&ram, &source);
    let mut buf = [0u8; 5];
    copy.read_bytes(&ram, 100, &mut buf);
    assert_eq!(&buf, b"frame");
}

#[test]
fn memory_map_is_split_aligned_and_carved() {
    let map = [
        // page 0 must never be used; the tail is not page aligned
        MemoryMapEntry::new(0, 0x9F800, MemoryKind::Usable),
        MemoryMapEntry::new(0xA0000, 0x60000, MemoryKind::Reserved),
        // straddles the low-memory limit, kernel image in the middle
        MemoryMapEntry::new(0x10_0000, 0x200_0000, MemoryKind::Usable),
        MemoryMapEntry::new(0x210_0000, 0x1000, MemoryKind::AcpiReclaimable),
    ];
    let kernel = PhysicalAddress::new(0x20_0000)..PhysicalAddress::new(0x30_0800);
    let frames = FrameAllocator::from_memory_map(&map, &[kernel]);

    let zones: Vec<_> = frames
        .zones()
        .iter()
        .map(|z| (z.kind(), z.lower().as_u64(), z.upper().as_u64()))
        .collect();
    assert_eq!(
        zones,
        vec![
            (ZoneKind::Normal, LOW_MEMORY_LIMIT, 0x210_0000),
            (ZoneKind::Low, 0x1000, 0x9F000),
            (ZoneKind::Low, 0x10_0000, 0x20_0000),
            (ZoneKind::Low, 0x30_1000, LOW_MEMORY_LIMIT),
        ]
    );
    assert_eq!(frames.total_pages(), frames.free_pages());
}

#[test]
fn committed_pages_stay_free_for_their_holder() {
    let frames = two_zone_allocator();
    let mut promised = frames.commit(3).unwrap();
    assert_eq!(frames.committed_pages(), 3);

    // Five uncommitted pages, then nothing for ordinary requests.
    let held: Vec<_> = (0..5)
        .map(|_| frames.allocate(FramePolicy::Any).unwrap())
        .collect();
    assert_eq!(frames.allocate(FramePolicy::Any).unwrap_err(), OutOfMemory);
    assert_eq!(frames.allocate_permanent(FramePolicy::Any).unwrap_err(), OutOfMemory);
    assert_eq!(frames.allocate_contiguous(1, FramePolicy::Any).unwrap_err(), OutOfMemory);
    assert_eq!(frames.free_pages(), 3);

    let taken: Vec<_> = (0..3).map(|_| promised.allocate(&frames).unwrap()).collect();
    assert_eq!(promised.remaining(), 0);
    assert_eq!(frames.committed_pages(), 0);
    assert_eq!(promised.allocate(&frames).unwrap_err(), OutOfMemory);
    drop((held, taken));
    assert_eq!(frames.free_pages(), 8);
}

#[test]
fn commitment_beyond_free_memory_is_refused() {
    let frames = two_zone_allocator();
    let _first = frames.commit(6).unwrap();
    assert_eq!(frames.commit(3).unwrap_err(), OutOfMemory);
    assert_eq!(frames.committed_pages(), 6);
    let _second = frames.commit(2).unwrap();
    assert_eq!(frames.committed_pages(), 8);
}

#[test]
fn dropping_a_commitment_gives_back_what_was_not_taken() {
    let frames = two_zone_allocator();
    let mut promised = frames.commit(4).unwrap();
    let frame = promised.allocate(&frames).unwrap();
    assert_eq!(frames.committed_pages(), 3);
    drop(promised);
    assert_eq!(frames.committed_pages(), 0);

    // The taken frame is an ordinary frame now.
    let rest: Vec<_> = (0..7)
        .map(|_| frames.allocate(FramePolicy::Any).unwrap())
        .collect();
    drop((frame, rest));
    assert_eq!(frames.free_pages(), 8);
}
