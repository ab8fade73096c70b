// Page Directory Abstraction
use alloc::collections::BTreeMap;
use x86_64::structures::paging::{Page, PageTableFlags, PhysFrame};

/// Hardware page-table interface consumed by the paging core.
///
/// A real kernel backs this with its MMU page-directory code; hosted builds
/// and tests use [`SoftPageDirectory`].
pub trait PageDirectory {
    /// Map `upage` to `kpage`. Returns false if `upage` is already mapped or
    /// the page-table structure cannot be grown.
    fn map_page(&mut self, upage: Page, kpage: PhysFrame, writable: bool) -> bool;

    /// Drop the mapping for `upage`, if any.
    fn unmap_page(&mut self, upage: Page);

    /// Physical frame currently mapped at `upage`.
    fn translate(&self, upage: Page) -> Option<PhysFrame>;

    fn is_accessed(&self, upage: Page) -> bool;
    fn set_accessed(&mut self, upage: Page, value: bool);
    fn is_dirty(&self, upage: Page) -> bool;
}

struct SoftEntry {
    frame: PhysFrame,
    flags: PageTableFlags,
}

/// Software page directory keeping x86-style entry flags in a map.
///
/// The accessed and dirty bits a real MMU maintains are recorded through
/// [`SoftPageDirectory::mark_access`].
pub struct SoftPageDirectory {
    entries: BTreeMap<Page, SoftEntry>,
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Record an access the hardware would have observed on `upage`.
    pub fn mark_access(&mut self, upage: Page, write: bool) {
        if let Some(entry) = self.entries.get_mut(&upage) {
            entry.flags.insert(PageTableFlags::ACCESSED);
            if write {
                entry.flags.insert(PageTableFlags::DIRTY);
            }
        }
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }
}

impl PageDirectory for SoftPageDirectory {
    fn map_page(&mut self, upage: Page, kpage: PhysFrame, writable: bool) -> bool {
        if self.entries.contains_key(&upage) {
            return false;
        }
        // The access that faulted completes as soon as the mapping exists,
        // so the entry starts out accessed.
        let mut flags =
            PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::ACCESSED;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        self.entries.insert(
            upage,
            SoftEntry {
                frame: kpage,
                flags,
            },
        );
        true
    }

    fn unmap_page(&mut self, upage: Page) {
        self.entries.remove(&upage);
    }

    fn translate(&self, upage: Page) -> Option<PhysFrame> {
        self.entries.get(&upage).map(|entry| entry.frame)
    }

    fn is_accessed(&self, upage: Page) -> bool {
        match self.entries.get(&upage) {
            Some(entry) => entry.flags.contains(PageTableFlags::ACCESSED),
            None => false,
        }
    }

    fn set_accessed(&mut self, upage: Page, value: bool) {
        if let Some(entry) = self.entries.get_mut(&upage) {
            entry.flags.set(PageTableFlags::ACCESSED, value);
        }
    }

    fn is_dirty(&self, upage: Page) -> bool {
        match self.entries.get(&upage) {
            Some(entry) => entry.flags.contains(PageTableFlags::DIRTY),
            None => false,
        }
    }
}
