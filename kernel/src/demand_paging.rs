// Demand Paging
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use x86_64::structures::paging::page::PageRange;
use x86_64::structures::paging::{Page, PhysFrame};
use x86_64::VirtAddr;

use crate::address_space::AddressSpace;
use crate::frame_allocator::AllocFlags;
use crate::paging::PageDirectory;
use crate::swap::{BlockDevice, SwapSlot};
use crate::{VmCore, VmError, PAGE_SIZE};

/// Positional file I/O behind file-backed pages. Short transfers are
/// surfaced through the returned byte count.
pub trait MappedFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;
}

/// Where a page's contents currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// First touch produces a zero-filled frame.
    Zero,
    /// Resident in a physical frame.
    InMemory,
    /// Evicted to a swap slot.
    OnDisk,
    /// Fetched from the backing file on first touch (or refetched, for
    /// clean read-only pages discarded under pressure).
    FileBacked,
}

/// File region backing a page. Retained for the page's whole lifetime once
/// installed, whatever state the page moves through afterwards.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn MappedFile>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
}

/// Per-page bookkeeping entry.
#[derive(Clone)]
pub struct PageInfo {
    pub state: PageState,
    pub frame: Option<PhysFrame>,
    pub swap_slot: Option<SwapSlot>,
    pub backing: Option<FileBacking>,
    /// Sticky dirty bit: accumulates writes the hardware bit would lose,
    /// e.g. across an eviction of a mapped file's page.
    pub dirty: bool,
}

impl PageInfo {
    pub fn new_zero() -> Self {
        Self {
            state: PageState::Zero,
            frame: None,
            swap_slot: None,
            backing: None,
            dirty: false,
        }
    }

    pub fn new_frame(kpage: PhysFrame) -> Self {
        Self {
            state: PageState::InMemory,
            frame: Some(kpage),
            ..Self::new_zero()
        }
    }

    pub fn new_file(backing: FileBacking) -> Self {
        Self {
            state: PageState::FileBacked,
            backing: Some(backing),
            ..Self::new_zero()
        }
    }

    /// Effective writability of the hardware mapping for this page.
    pub fn writable(&self) -> bool {
        match &self.backing {
            Some(backing) => backing.writable,
            None => true,
        }
    }
}

/// The per-address-space map from user page to its bookkeeping entry.
pub struct PageMap {
    pages: BTreeMap<Page, PageInfo>,
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Insert a fresh entry; refuses to overwrite an installed page.
    pub fn insert(&mut self, upage: Page, info: PageInfo) -> Result<(), VmError> {
        if self.pages.contains_key(&upage) {
            return Err(VmError::AlreadyMapped);
        }
        self.pages.insert(upage, info);
        Ok(())
    }

    pub fn get(&self, upage: Page) -> Option<&PageInfo> {
        self.pages.get(&upage)
    }

    pub fn get_mut(&mut self, upage: Page) -> Option<&mut PageInfo> {
        self.pages.get_mut(&upage)
    }

    pub fn remove(&mut self, upage: Page) -> Option<PageInfo> {
        self.pages.remove(&upage)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Page, &PageInfo)> {
        self.pages.iter()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn take_all(&mut self) -> BTreeMap<Page, PageInfo> {
        core::mem::take(&mut self.pages)
    }
}

/// Fault a page in: pick a frame (possibly evicting), materialize the
/// contents from the page's current source, and map it.
pub fn load_page<P: PageDirectory, B: BlockDevice>(
    space: &Arc<AddressSpace<P>>,
    vm: &VmCore<P, B>,
    upage: Page,
) -> Result<(), VmError> {
    // Snapshot the entry instead of holding the map lock across the
    // allocation: eviction only rewrites resident entries, so a page that is
    // not yet resident cannot change under its owner.
    let info = match space.page_map().lock().get(upage) {
        Some(info) => info.clone(),
        None => return Err(VmError::NotFound),
    };
    if info.state == PageState::InMemory {
        // Already resident; nothing to load.
        return Ok(());
    }

    let flags = if info.state == PageState::Zero {
        AllocFlags::ZERO
    } else {
        AllocFlags::empty()
    };
    let kpage = match vm.frames.allocate(&vm.pool, &vm.swap, flags, space, upage) {
        Some(kpage) => kpage,
        None => return Err(VmError::OutOfMemory),
    };

    if let Err(err) = fill_frame(vm, &info, kpage) {
        vm.frames.free(&vm.pool, kpage);
        return Err(err);
    }

    let mapped = space.with_pagedir(|pd| pd.map_page(upage, kpage, info.writable()));
    if !mapped {
        vm.frames.free(&vm.pool, kpage);
        return Err(VmError::MapFailed);
    }

    let mut pages = space.page_map().lock();
    match pages.get_mut(upage) {
        Some(entry) => {
            entry.state = PageState::InMemory;
            entry.frame = Some(kpage);
            entry.swap_slot = None;
        }
        None => {
            // The entry was torn down while we were loading; back out.
            drop(pages);
            space.with_pagedir(|pd| pd.unmap_page(upage));
            vm.frames.free(&vm.pool, kpage);
            return Err(VmError::NotFound);
        }
    }
    Ok(())
}

fn fill_frame<P: PageDirectory, B: BlockDevice>(
    vm: &VmCore<P, B>,
    info: &PageInfo,
    kpage: PhysFrame,
) -> Result<(), VmError> {
    let buf = unsafe { vm.pool.frame_bytes_mut(kpage) };
    match info.state {
        PageState::OnDisk => {
            let slot = info.swap_slot.ok_or(VmError::InvalidSlot)?;
            vm.swap.swap_in(slot, buf)
        }
        PageState::FileBacked => {
            let backing = info.backing.as_ref().ok_or(VmError::NotFound)?;
            let read = backing.file.read_at(&mut buf[..backing.read_bytes], backing.offset);
            if read != backing.read_bytes {
                return Err(VmError::ShortRead);
            }
            buf[backing.read_bytes..].fill(0);
            Ok(())
        }
        // The pool zero-filled the frame for us.
        PageState::Zero => Ok(()),
        PageState::InMemory => Ok(()),
    }
}

/// Tear down one page of a memory-mapped file region, writing modified
/// contents back to `file` at `offset` first.
pub fn mm_unmap<P: PageDirectory, B: BlockDevice>(
    space: &Arc<AddressSpace<P>>,
    vm: &VmCore<P, B>,
    upage: Page,
    file: &dyn MappedFile,
    offset: u64,
    bytes: usize,
) -> Result<(), VmError> {
    debug_assert!(bytes <= PAGE_SIZE);
    // Remove the entry first: an eviction that raced us to this page backs
    // off once the entry is gone, leaving the teardown entirely to us.
    let info = match space.page_map().lock().remove(upage) {
        Some(info) => info,
        None => return Err(VmError::NotFound),
    };

    match info.state {
        PageState::InMemory => {
            let kpage = match info.frame {
                Some(kpage) => kpage,
                None => return Err(VmError::NotFound),
            };
            // Read the hardware bit before the mapping disappears.
            let dirty = info.dirty || space.with_pagedir(|pd| pd.is_dirty(upage));
            if dirty && info.writable() {
                let data = unsafe { vm.pool.frame_bytes(kpage) };
                file.write_at(&data[..bytes], offset);
            }
            space.with_pagedir(|pd| pd.unmap_page(upage));
            vm.frames.free(&vm.pool, kpage);
        }
        PageState::OnDisk => {
            let slot = match info.swap_slot {
                Some(slot) => slot,
                None => return Err(VmError::InvalidSlot),
            };
            if info.dirty {
                // The modified contents only exist in swap; pull them back
                // through a scratch page before writing them to the file.
                let mut scratch = Box::new([0u8; PAGE_SIZE]);
                vm.swap.swap_in(slot, &mut scratch[..])?;
                file.write_at(&scratch[..bytes], offset);
            } else {
                vm.swap.free_slot(slot);
            }
        }
        PageState::Zero | PageState::FileBacked => {}
    }
    Ok(())
}

/// Fault in and pin every page covering `[buffer, buffer + size)`, so a
/// kernel I/O path can touch the range without faulting.
pub fn preload_and_pin_pages<P: PageDirectory, B: BlockDevice>(
    space: &Arc<AddressSpace<P>>,
    vm: &VmCore<P, B>,
    buffer: VirtAddr,
    size: usize,
) -> Result<(), VmError> {
    for upage in pages_covering(buffer, size) {
        load_page(space, vm, upage)?;
        if let Some(kpage) = space.lookup(upage).and_then(|view| view.frame) {
            vm.frames.set_pinned(kpage, true);
        }
    }
    Ok(())
}

/// Release the pins taken by [`preload_and_pin_pages`].
pub fn unpin_preloaded_pages<P: PageDirectory, B: BlockDevice>(
    space: &Arc<AddressSpace<P>>,
    vm: &VmCore<P, B>,
    buffer: VirtAddr,
    size: usize,
) {
    for upage in pages_covering(buffer, size) {
        if let Some(kpage) = space.lookup(upage).and_then(|view| view.frame) {
            vm.frames.set_pinned(kpage, false);
        }
    }
}

fn pages_covering(buffer: VirtAddr, size: usize) -> PageRange {
    let start = Page::containing_address(buffer);
    if size == 0 {
        return Page::range(start, start);
    }
    let last = Page::containing_address(buffer + (size as u64 - 1));
    Page::range(start, last + 1)
}
