// Address Spaces
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use x86_64::structures::paging::{Page, PhysFrame};

use crate::demand_paging::{FileBacking, MappedFile, PageInfo, PageMap, PageState};
use crate::paging::PageDirectory;
use crate::swap::{BlockDevice, SwapSlot};
use crate::{VmCore, VmError};

pub type Asid = u64;

static NEXT_ASID: AtomicU64 = AtomicU64::new(1);

/// One user address space: its page directory plus the page map describing
/// where every installed page's contents live.
///
/// The page map is normally touched only by the owning process; eviction
/// reaches into a foreign space through the frame table's back-reference,
/// serialized by the frame lock.
pub struct AddressSpace<P: PageDirectory> {
    id: Asid,
    pagedir: Mutex<P>,
    pages: Mutex<PageMap>,
}

/// Read-only copy of one page's bookkeeping.
#[derive(Clone)]
pub struct PageView {
    pub state: PageState,
    pub frame: Option<PhysFrame>,
    pub swap_slot: Option<SwapSlot>,
    pub dirty: bool,
    pub writable: bool,
}

fn view(info: &PageInfo) -> PageView {
    PageView {
        state: info.state,
        frame: info.frame,
        swap_slot: info.swap_slot,
        dirty: info.dirty,
        writable: info.writable(),
    }
}

impl<P: PageDirectory> AddressSpace<P> {
    pub fn new(pagedir: P) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ASID.fetch_add(1, Ordering::Relaxed),
            pagedir: Mutex::new(pagedir),
            pages: Mutex::new(PageMap::new()),
        })
    }

    pub fn id(&self) -> Asid {
        self.id
    }

    /// Run `f` against the page directory. The lock is held only for the
    /// call, never across another subsystem.
    pub fn with_pagedir<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        let mut pagedir = self.pagedir.lock();
        f(&mut *pagedir)
    }

    pub(crate) fn page_map(&self) -> &Mutex<PageMap> {
        &self.pages
    }

    /// Install a page whose first touch reads `read_bytes` from `file` at
    /// `offset` and zero-fills the remaining `zero_bytes`.
    pub fn install_filesys(
        &self,
        upage: Page,
        file: Arc<dyn MappedFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        debug_assert_eq!(read_bytes + zero_bytes, crate::PAGE_SIZE);
        self.pages.lock().insert(
            upage,
            PageInfo::new_file(FileBacking {
                file,
                offset,
                read_bytes,
                zero_bytes,
                writable,
            }),
        )
    }

    /// Install a page already resident in `kpage`. The caller has obtained
    /// the frame from the frame table and mapped it.
    pub fn install_frame(&self, upage: Page, kpage: PhysFrame) -> Result<(), VmError> {
        self.pages.lock().insert(upage, PageInfo::new_frame(kpage))
    }

    /// Install a page whose first touch produces a zero-filled frame.
    pub fn install_zeropage(&self, upage: Page) -> Result<(), VmError> {
        self.pages.lock().insert(upage, PageInfo::new_zero())
    }

    /// Move a resident page's entry to a swap slot. Only resident pages can
    /// make this transition.
    pub fn set_swap(&self, upage: Page, slot: SwapSlot) -> Result<(), VmError> {
        let mut pages = self.pages.lock();
        let info = match pages.get_mut(upage) {
            Some(info) => info,
            None => return Err(VmError::NotFound),
        };
        if info.state != PageState::InMemory {
            return Err(VmError::InvalidTransition);
        }
        info.state = PageState::OnDisk;
        info.frame = None;
        info.swap_slot = Some(slot);
        Ok(())
    }

    /// Set the sticky dirty bit.
    pub fn set_dirty(&self, upage: Page, dirty: bool) -> Result<(), VmError> {
        match self.pages.lock().get_mut(upage) {
            Some(info) => {
                info.dirty = dirty;
                Ok(())
            }
            None => Err(VmError::NotFound),
        }
    }

    pub fn lookup(&self, upage: Page) -> Option<PageView> {
        self.pages.lock().get(upage).map(view)
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn snapshot(&self) -> Vec<(Page, PageView)> {
        self.pages
            .lock()
            .iter()
            .map(|(upage, info)| (*upage, view(info)))
            .collect()
    }

    pub(crate) fn is_resident_on(&self, upage: Page, kpage: PhysFrame) -> bool {
        match self.pages.lock().get(upage) {
            Some(info) => info.state == PageState::InMemory && info.frame == Some(kpage),
            None => false,
        }
    }

    /// Tear the space down: free every resident frame, release every swap
    /// slot, drop every entry.
    pub fn destroy<B: BlockDevice>(&self, vm: &VmCore<P, B>) {
        let drained = self.pages.lock().take_all();
        for (upage, info) in drained {
            match info.state {
                PageState::InMemory => {
                    if let Some(kpage) = info.frame {
                        self.with_pagedir(|pd| pd.unmap_page(upage));
                        vm.frames.free(&vm.pool, kpage);
                    }
                }
                PageState::OnDisk => {
                    if let Some(slot) = info.swap_slot {
                        vm.swap.free_slot(slot);
                    }
                }
                PageState::Zero | PageState::FileBacked => {}
            }
        }
        log::debug!("Address space {} destroyed", self.id);
    }
}
