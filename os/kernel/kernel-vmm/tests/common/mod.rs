//! A software machine for the memory core: host-backed RAM, page tables in
//! hash maps and an emulated processor.
#![allow(dead_code)]

use std::cell::UnsafeCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kernel_alloc::{FRAME_BYTES, FrameAllocator, FramePolicy, OutOfMemory, PhysMapper, PhysicalZone, ZoneKind};
use kernel_info::memory::{KERNEL_VM_BASE, LOW_MEMORY_LIMIT, USER_RANGE_BASE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_sync::PreemptCounter;
use kernel_vmem::{MapError, Mmu, PageTableRoot, Processor, PteFlags, Translation};
use kernel_vmm::{Inode, IoError, Vmm};

pub const PAGE: u64 = 4096;

/// Where test RAM starts unless a test asks otherwise: just above low memory.
pub const RAM_BASE: u64 = LOW_MEMORY_LIMIT;

/// Fake physical addresses for page-table roots; never part of RAM.
const ROOT_BASE: u64 = 0x7f00_0000_0000;

#[repr(C, align(4096))]
struct Page(UnsafeCell<[u8; FRAME_BYTES]>);

struct Segment {
    base: u64,
    pages: Box<[Page]>,
}

impl Segment {
    fn end(&self) -> u64 {
        self.base + self.pages.len() as u64 * PAGE
    }
}

pub struct TestMachine {
    ram: Vec<Segment>,
    tables: Mutex<HashMap<PageTableRoot, BTreeMap<VirtualAddress, Translation>>>,
    kernel_root: PageTableRoot,
    active: Mutex<PageTableRoot>,
    next_root: AtomicU64,
    installs: AtomicUsize,
    preempt: PreemptCounter,
}

// SAFETY: RAM is only reached through `PhysMapper` and `pointer_to`, whose
// callers keep accesses apart.
unsafe impl Sync for TestMachine {}

impl TestMachine {
    /// RAM made of `(base, pages)` segments.
    pub fn new(segments: &[(u64, usize)]) -> Self {
        let ram = segments
            .iter()
            .map(|&(base, pages)| Segment {
                base,
                pages: (0..pages).map(|_| Page(UnsafeCell::new([0; FRAME_BYTES]))).collect(),
            })
            .collect();
        let kernel_root = PageTableRoot::new(PhysicalAddress::new(ROOT_BASE));
        let mut tables = HashMap::new();
        tables.insert(kernel_root, BTreeMap::new());
        Self {
            ram,
            tables: Mutex::new(tables),
            kernel_root,
            active: Mutex::new(kernel_root),
            next_root: AtomicU64::new(1),
            installs: AtomicUsize::new(0),
            preempt: PreemptCounter::new(),
        }
    }

    pub fn with_pages(pages: usize) -> Self {
        Self::new(&[(RAM_BASE, pages)])
    }

    /// One zone per segment.
    pub fn frame_allocator(&self) -> FrameAllocator {
        let mut frames = FrameAllocator::new();
        for segment in &self.ram {
            let kind = if segment.base < LOW_MEMORY_LIMIT {
                ZoneKind::Low
            } else {
                ZoneKind::Normal
            };
            frames.add_zone(PhysicalZone::new(
                kind,
                PhysicalAddress::new(segment.base),
                PhysicalAddress::new(segment.end()),
            ));
        }
        frames
    }

    pub const fn kernel_root(&self) -> PageTableRoot {
        self.kernel_root
    }

    /// How often a root was loaded.
    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn is_live(&self, root: PageTableRoot) -> bool {
        self.tables.lock().unwrap().contains_key(&root)
    }

    pub fn mapped_pages(&self, root: PageTableRoot) -> usize {
        self.tables.lock().unwrap().get(&root).map_or(0, BTreeMap::len)
    }

    pub fn pin_depth(&self) -> usize {
        self.preempt.depth()
    }

    /// The table holding `va`: kernel addresses live in the shared kernel
    /// half.
    fn table_for(&self, root: PageTableRoot, va: VirtualAddress) -> PageTableRoot {
        if va.as_u64() >= KERNEL_VM_BASE {
            self.kernel_root
        } else {
            root
        }
    }

    fn host_pointer(&self, pa: PhysicalAddress) -> *mut u8 {
        let pa = pa.as_u64();
        let segment = self
            .ram
            .iter()
            .find(|segment| (segment.base..segment.end()).contains(&pa))
            .unwrap_or_else(|| panic!("physical address {pa:#x} outside test RAM"));
        let offset = usize::try_from(pa - segment.base).unwrap();
        let page = &segment.pages[offset / FRAME_BYTES];
        // SAFETY: the offset stays inside the page.
        unsafe { page.0.get().cast::<u8>().add(offset % FRAME_BYTES) }
    }
}

impl PhysMapper for TestMachine {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: the caller guarantees size, alignment and exclusivity.
        unsafe { &mut *self.host_pointer(pa).cast::<T>() }
    }
}

impl Mmu for TestMachine {
    fn create_root(&self, _frames: &FrameAllocator) -> Result<PageTableRoot, OutOfMemory> {
        let index = self.next_root.fetch_add(1, Ordering::SeqCst);
        let root = PageTableRoot::new(PhysicalAddress::new(ROOT_BASE + index * PAGE));
        self.tables.lock().unwrap().insert(root, BTreeMap::new());
        Ok(root)
    }

    fn destroy_root(&self, root: PageTableRoot) {
        assert_ne!(root, self.kernel_root, "kernel root destroyed");
        assert!(self.tables.lock().unwrap().remove(&root).is_some(), "unknown root {root:?}");
    }

    fn map_page(
        &self,
        _frames: &FrameAllocator,
        root: PageTableRoot,
        va: VirtualAddress,
        frame: PhysicalAddress,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        assert!(va.is_page_aligned() && frame.is_page_aligned());
        let table = self.table_for(root, va);
        let mut tables = self.tables.lock().unwrap();
        let entries = tables
            .get_mut(&table)
            .unwrap_or_else(|| panic!("unknown root {table:?}"));
        if entries.contains_key(&va) {
            return Err(MapError::AlreadyMapped(va));
        }
        entries.insert(va, Translation { frame, flags });
        Ok(())
    }

    fn protect_page(&self, root: PageTableRoot, va: VirtualAddress, flags: PteFlags) -> Option<Translation> {
        let table = self.table_for(root, va);
        let mut tables = self.tables.lock().unwrap();
        let entry = tables.get_mut(&table)?.get_mut(&va)?;
        let old = *entry;
        entry.flags = flags;
        Some(old)
    }

    fn unmap_page(&self, root: PageTableRoot, va: VirtualAddress) -> Option<PhysicalAddress> {
        let table = self.table_for(root, va);
        self.tables
            .lock()
            .unwrap()
            .get_mut(&table)?
            .remove(&va)
            .map(|translation| translation.frame)
    }

    fn translate(&self, root: PageTableRoot, va: VirtualAddress) -> Option<Translation> {
        let table = self.table_for(root, va);
        self.tables.lock().unwrap().get(&table)?.get(&va.page_base()).copied()
    }

    fn flush(&self, _root: PageTableRoot, _range: VirtualRange) {}
}

impl Processor for TestMachine {
    fn active_root(&self) -> PageTableRoot {
        *self.active.lock().unwrap()
    }

    unsafe fn install_root(&self, root: PageTableRoot) {
        assert!(self.is_live(root), "installing dead root {root:?}");
        *self.active.lock().unwrap() = root;
        self.installs.fetch_add(1, Ordering::SeqCst);
    }

    fn preempt(&self) -> &PreemptCounter {
        &self.preempt
    }

    fn pointer_to(&self, va: VirtualAddress) -> *mut u8 {
        let translation = self
            .translate(self.active_root(), va)
            .unwrap_or_else(|| panic!("{va} is not mapped in the active address space"));
        self.host_pointer(translation.frame + va.page_offset())
    }
}

/// A memory core over `pages` pages of normal RAM.
pub fn vmm(pages: usize) -> Vmm<TestMachine> {
    let machine = TestMachine::with_pages(pages);
    let frames = machine.frame_allocator();
    Vmm::new(machine, frames)
}

/// Fills every free page with `0xAA` so that zero-filling is observable.
pub fn scribble_free_pages(vmm: &Vmm<TestMachine>) {
    let mut held = Vec::new();
    while let Ok(frame) = vmm.frames().allocate(FramePolicy::Any) {
        frame.with_bytes(vmm.platform(), |bytes| bytes.fill(0xAA));
        held.push(frame);
    }
}

pub fn user_va(offset: u64) -> VirtualAddress {
    VirtualAddress::new(USER_RANGE_BASE + offset)
}

/// An in-memory file that records what the memory core does with it.
pub struct TestInode {
    id: u64,
    data: Mutex<Vec<u8>>,
    writes: Mutex<Vec<u64>>,
    write_attempts: AtomicUsize,
    reads: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl TestInode {
    pub fn new(id: u64, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            id,
            data: Mutex::new(data),
            writes: Mutex::new(Vec::new()),
            write_attempts: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// `len` bytes of a recognisable, non-zero pattern.
    pub fn patterned(id: u64, len: usize) -> Arc<Self> {
        #[allow(clippy::cast_possible_truncation)]
        let data = (0..len).map(|i| (i % 251) as u8 + 1).collect();
        Self::new(id, data)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Offsets of successful page writes, in order.
    pub fn writes(&self) -> Vec<u64> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Cuts the file to `len` bytes.
    pub fn truncate(&self, len: usize) {
        self.data.lock().unwrap().truncate(len);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Inode for TestInode {
    fn id(&self) -> u64 {
        self.id
    }

    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn read_page(&self, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(IoError { inode: self.id, offset });
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock().unwrap();
        let start = usize::try_from(offset).unwrap().min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write_page(&self, offset: u64, bytes: &[u8]) -> Result<(), IoError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IoError { inode: self.id, offset });
        }
        let start = usize::try_from(offset).unwrap();
        let mut data = self.data.lock().unwrap();
        if data.len() < start + bytes.len() {
            data.resize(start + bytes.len(), 0);
        }
        data[start..start + bytes.len()].copy_from_slice(bytes);
        self.writes.lock().unwrap().push(offset);
        Ok(())
    }
}
