// Frame Table and Eviction
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::{Page, PhysFrame};

use crate::address_space::{AddressSpace, Asid};
use crate::demand_paging::PageState;
use crate::frame_allocator::{AllocFlags, FramePool};
use crate::paging::PageDirectory;
use crate::swap::{BlockDevice, SwapManager};

struct FrameEntry<P: PageDirectory> {
    upage: Page,
    // Non-owning back-reference to the owning space, used only under the
    // frame lock. The space itself belongs to its process.
    owner: Weak<AddressSpace<P>>,
    asid: Asid,
    pinned: bool,
}

/// Registry of every user frame currently handed out, keyed by the frame.
/// One lock serializes allocation, eviction, pinning and freeing, so a pin
/// can never race victim selection.
pub struct FrameTable<P: PageDirectory> {
    entries: Mutex<BTreeMap<PhysFrame, FrameEntry<P>>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTableStats {
    pub frames: usize,
    pub pinned: usize,
}

impl<P: PageDirectory> FrameTable<P> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Obtain a user frame for `upage` in `owner`'s space and register it,
    /// unpinned. When the pool is dry, one eviction attempt is made and the
    /// pool is retried exactly once; `None` means nothing could be
    /// reclaimed.
    pub fn allocate<B: BlockDevice>(
        &self,
        pool: &FramePool,
        swap: &SwapManager<B>,
        flags: AllocFlags,
        owner: &Arc<AddressSpace<P>>,
        upage: Page,
    ) -> Option<PhysFrame> {
        let mut entries = self.entries.lock();
        let mut kpage = pool.alloc(flags);
        if kpage.is_none() && Self::evict_one(&mut entries, pool, swap) {
            kpage = pool.alloc(flags);
        }
        let kpage = kpage?;
        entries.insert(
            kpage,
            FrameEntry {
                upage,
                owner: Arc::downgrade(owner),
                asid: owner.id(),
                pinned: false,
            },
        );
        Some(kpage)
    }

    /// Unregister `kpage` and return it to the pool.
    pub fn free(&self, pool: &FramePool, kpage: PhysFrame) {
        let mut entries = self.entries.lock();
        if entries.remove(&kpage).is_some() {
            pool.free(kpage);
        } else {
            log::warn!("Freeing unregistered frame {:?}", kpage);
        }
    }

    /// Toggle eviction eligibility for `kpage`; unknown frames are a no-op.
    pub fn set_pinned(&self, kpage: PhysFrame, pinned: bool) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&kpage) {
            Some(entry) => entry.pinned = pinned,
            None => log::warn!("Pin request for unregistered frame {:?}", kpage),
        }
    }

    pub fn stats(&self) -> FrameTableStats {
        let entries = self.entries.lock();
        FrameTableStats {
            frames: entries.len(),
            pinned: entries.values().filter(|entry| entry.pinned).count(),
        }
    }

    /// `(kpage, upage, asid, pinned)` for every registered frame.
    pub fn snapshot(&self) -> Vec<(PhysFrame, Page, Asid, bool)> {
        self.entries
            .lock()
            .iter()
            .map(|(kpage, entry)| (*kpage, entry.upage, entry.asid, entry.pinned))
            .collect()
    }

    // Second-chance scan, two passes over the table in frame order: an
    // unpinned, live, resident entry whose accessed bit is clear is the
    // victim; otherwise the bit is cleared and the scan moves on. The
    // second pass picks up entries whose bit the first pass cleared.
    fn pick_victim(entries: &BTreeMap<PhysFrame, FrameEntry<P>>) -> Option<PhysFrame> {
        for _pass in 0..2 {
            for (kpage, entry) in entries.iter() {
                if entry.pinned {
                    continue;
                }
                let owner = match entry.owner.upgrade() {
                    Some(owner) => owner,
                    None => continue,
                };
                if !owner.is_resident_on(entry.upage, *kpage) {
                    // Mid-load or mid-teardown; not a candidate.
                    continue;
                }
                if owner.with_pagedir(|pd| pd.is_accessed(entry.upage)) {
                    owner.with_pagedir(|pd| pd.set_accessed(entry.upage, false));
                    continue;
                }
                return Some(*kpage);
            }
        }
        None
    }

    // Evict one frame: move the victim's contents out (swap, or nothing for
    // a clean re-fetchable read-only file page), retarget its page-map
    // entry, clear its hardware mapping and return the frame to the pool.
    // Runs under the frame lock. Returns false if nothing was reclaimed.
    fn evict_one<B: BlockDevice>(
        entries: &mut BTreeMap<PhysFrame, FrameEntry<P>>,
        pool: &FramePool,
        swap: &SwapManager<B>,
    ) -> bool {
        let kpage = match Self::pick_victim(entries) {
            Some(kpage) => kpage,
            None => {
                log::debug!("Eviction found no victim");
                return false;
            }
        };
        let (owner, upage, asid) = match entries.get(&kpage) {
            Some(entry) => match entry.owner.upgrade() {
                Some(owner) => (owner, entry.upage, entry.asid),
                None => return false,
            },
            None => return false,
        };

        // The hardware dirty bit is folded into the sticky bit now, before
        // the mapping (and the bit with it) is torn down.
        let hw_dirty = owner.with_pagedir(|pd| pd.is_dirty(upage));
        let moved = {
            let mut pages = owner.page_map().lock();
            let info = match pages.get_mut(upage) {
                Some(info) => info,
                // A concurrent unmap got here first; its teardown owns the
                // frame, so back off.
                None => return false,
            };
            if info.state != PageState::InMemory || info.frame != Some(kpage) {
                return false;
            }
            info.dirty = info.dirty || hw_dirty;
            let refetchable = match &info.backing {
                Some(backing) => !backing.writable,
                None => false,
            };
            if refetchable {
                // Read-only file contents can be fetched again; never burn
                // a swap slot on them.
                info.state = PageState::FileBacked;
                info.frame = None;
                true
            } else {
                let data = unsafe { pool.frame_bytes(kpage) };
                match swap.swap_out(data) {
                    Ok(slot) => {
                        info.state = PageState::OnDisk;
                        info.swap_slot = Some(slot);
                        info.frame = None;
                        true
                    }
                    Err(err) => {
                        log::warn!("Eviction aborted: {:?}", err);
                        false
                    }
                }
            }
        };
        if !moved {
            return false;
        }

        owner.with_pagedir(|pd| pd.unmap_page(upage));
        entries.remove(&kpage);
        pool.free(kpage);
        log::debug!("Evicted {:?} from space {}", upage, asid);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{upage, TestBed};

    #[test]
    fn allocate_registers_and_free_unregisters() {
        let bed = TestBed::new(2, 4);
        let space = bed.space();
        let kpage = bed
            .vm
            .frames
            .allocate(&bed.vm.pool, &bed.vm.swap, AllocFlags::empty(), &space, upage(0x1000))
            .unwrap();

        let snapshot = bed.vm.frames.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0], (kpage, upage(0x1000), space.id(), false));

        bed.vm.frames.free(&bed.vm.pool, kpage);
        assert_eq!(bed.vm.frames.stats().frames, 0);
        assert_eq!(bed.vm.pool.stats().1, 2);
    }

    #[test]
    fn pinning_unknown_frames_is_a_no_op() {
        let bed = TestBed::new(1, 4);
        let space = bed.space();
        let kpage = bed
            .vm
            .frames
            .allocate(&bed.vm.pool, &bed.vm.swap, AllocFlags::empty(), &space, upage(0x1000))
            .unwrap();
        // A frame address the table has never seen.
        let stranger = PhysFrame::containing_address(x86_64::PhysAddr::new(
            kpage.start_address().as_u64() + 0x10_0000,
        ));
        bed.vm.frames.set_pinned(stranger, true);
        assert_eq!(bed.vm.frames.stats().pinned, 0);

        bed.vm.frames.set_pinned(kpage, true);
        assert_eq!(bed.vm.frames.stats().pinned, 1);
        bed.vm.frames.set_pinned(kpage, false);
        assert_eq!(bed.vm.frames.stats().pinned, 0);
    }

    #[test]
    fn allocation_without_victims_fails_cleanly() {
        let bed = TestBed::new(1, 4);
        let space = bed.space();
        // The only frame is handed out but its page never becomes resident,
        // so eviction has no candidate.
        let _kpage = bed
            .vm
            .frames
            .allocate(&bed.vm.pool, &bed.vm.swap, AllocFlags::empty(), &space, upage(0x1000))
            .unwrap();
        assert!(bed
            .vm
            .frames
            .allocate(&bed.vm.pool, &bed.vm.swap, AllocFlags::empty(), &space, upage(0x2000))
            .is_none());
    }
}
