// Shared test fixtures: in-memory collaborators and a small paging bed.
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::{Page, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::demand_paging::MappedFile;
use crate::paging::{PageDirectory, SoftPageDirectory};
use crate::swap::BlockDevice;
use crate::{AddressSpace, FramePool, VmCore, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

pub fn upage(addr: u64) -> Page {
    Page::containing_address(VirtAddr::new(addr))
}

pub fn vaddr(addr: u64) -> VirtAddr {
    VirtAddr::new(addr)
}

/// Page-aligned backing storage for a [`FramePool`].
#[repr(align(4096))]
pub struct PageBuf(pub [u8; PAGE_SIZE]);

pub fn make_arena(frames: usize) -> Box<[PageBuf]> {
    (0..frames).map(|_| PageBuf([0; PAGE_SIZE])).collect()
}

/// A pool over a fresh arena; the host heap plays the part of physical
/// memory, so the physical-to-virtual offset is zero.
pub fn make_pool(frames: usize) -> (Box<[PageBuf]>, FramePool) {
    let arena = make_arena(frames);
    let base = PhysAddr::new(arena.as_ptr() as u64);
    let pool = unsafe { FramePool::new(base, frames, 0) };
    (arena, pool)
}

/// Block device over a plain sector vector.
pub struct MemDisk {
    sectors: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![0; sector_count * SECTOR_SIZE]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u64 {
        (self.sectors.lock().len() / SECTOR_SIZE) as u64
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) {
        let offset = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.sectors.lock()[offset..offset + SECTOR_SIZE]);
    }

    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) {
        let offset = sector as usize * SECTOR_SIZE;
        self.sectors.lock()[offset..offset + SECTOR_SIZE].copy_from_slice(buf);
    }
}

/// File over a byte vector; writes past the end grow it.
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl MappedFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.data.lock();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        buf.len()
    }
}

pub type TestSpace = Arc<AddressSpace<SoftPageDirectory>>;

/// A complete core over `frames` user frames and `swap_slots` swap slots.
pub struct TestBed {
    pub vm: VmCore<SoftPageDirectory, MemDisk>,
    _arena: Box<[PageBuf]>,
}

impl TestBed {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        let (arena, pool) = make_pool(frames);
        let disk = MemDisk::new(swap_slots * SECTORS_PER_PAGE);
        let vm = VmCore::new(pool, disk).expect("swap device too small");
        TestBed { vm, _arena: arena }
    }

    pub fn space(&self) -> TestSpace {
        AddressSpace::new(SoftPageDirectory::new())
    }

    pub fn frame_of(&self, space: &TestSpace, upage: Page) -> PhysFrame {
        space
            .lookup(upage)
            .and_then(|view| view.frame)
            .expect("page not resident")
    }

    /// Store `byte` across the whole page the way a user write would,
    /// recording the access in the software page directory.
    pub fn user_write(&self, space: &TestSpace, upage: Page, byte: u8) {
        let kpage = self.frame_of(space, upage);
        unsafe { self.vm.pool.frame_bytes_mut(kpage).fill(byte) };
        space.with_pagedir(|pd| pd.mark_access(upage, true));
    }

    pub fn read_frame(&self, space: &TestSpace, upage: Page) -> Vec<u8> {
        let kpage = self.frame_of(space, upage);
        unsafe { self.vm.pool.frame_bytes(kpage).to_vec() }
    }

    /// Structural cross-check of the page maps, frame table, page
    /// directories and swap bitmap.
    pub fn check_consistency(&self, spaces: &[&TestSpace]) {
        use std::collections::BTreeSet;

        let frame_table = self.vm.frames.snapshot();
        let mut kpages = BTreeSet::new();
        let mut slots = BTreeSet::new();

        for space in spaces {
            for (upage, view) in space.snapshot() {
                if let Some(kpage) = view.frame {
                    assert_eq!(view.state, crate::PageState::InMemory);
                    assert!(kpages.insert(kpage), "frame {:?} referenced twice", kpage);

                    let entry = frame_table
                        .iter()
                        .find(|(frame, ..)| *frame == kpage)
                        .expect("resident page missing from the frame table");
                    assert_eq!(entry.1, upage);
                    assert_eq!(entry.2, space.id());
                    assert_eq!(
                        space.with_pagedir(|pd| pd.translate(upage)),
                        Some(kpage),
                        "page directory disagrees for {:?}",
                        upage
                    );
                }
                if let Some(slot) = view.swap_slot {
                    assert_eq!(view.state, crate::PageState::OnDisk);
                    assert!(slots.insert(slot), "swap slot {} referenced twice", slot);
                    assert!(self.vm.swap.slot_in_use(slot));
                }
            }
        }
    }
}
