//! Demand-paged virtual memory core: a user frame pool with second-chance
//! eviction, per-address-space page bookkeeping, and a block-device swap
//! store. The MMU, file system and block layer are consumed through traits
//! so the core runs hosted (and under test) as well as on bare metal.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod demand_paging;
pub mod frame_allocator;
pub mod frame_table;
pub mod paging;
pub mod swap;

#[cfg(test)]
mod tests;

pub use address_space::{AddressSpace, Asid, PageView};
pub use demand_paging::{
    load_page, mm_unmap, preload_and_pin_pages, unpin_preloaded_pages, FileBacking, MappedFile,
    PageInfo, PageMap, PageState,
};
pub use frame_allocator::{AllocFlags, FramePool};
pub use frame_table::{FrameTable, FrameTableStats};
pub use paging::{PageDirectory, SoftPageDirectory};
pub use swap::{BlockDevice, SwapManager, SwapSlot, SwapStats};

pub const PAGE_SIZE: usize = 4096;
pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No entry installed for the page.
    NotFound,
    /// Install attempted on an already-installed page.
    AlreadyMapped,
    /// A page-state change that the lifecycle does not allow.
    InvalidTransition,
    /// No frame available and eviction reclaimed nothing.
    OutOfMemory,
    /// Every swap slot is in use.
    SwapExhausted,
    /// No usable swap device.
    NoSwapDevice,
    /// Swap slot index that is out of range or not in use.
    InvalidSlot,
    /// The backing file returned fewer bytes than the page needs.
    ShortRead,
    /// The page directory refused the mapping.
    MapFailed,
}

/// The three subsystems bundled behind one handle, brought up together at
/// boot and passed explicitly to the paging operations.
pub struct VmCore<P: PageDirectory, B: BlockDevice> {
    pub pool: FramePool,
    pub frames: FrameTable<P>,
    pub swap: SwapManager<B>,
}

impl<P: PageDirectory, B: BlockDevice> VmCore<P, B> {
    pub fn new(pool: FramePool, swap_device: B) -> Result<Self, VmError> {
        let swap = SwapManager::new(swap_device)?;
        let (total, _, _) = pool.stats();
        log::info!(
            "VM core online: {} user frames, {} swap slots",
            total,
            swap.stats().total_slots
        );
        Ok(Self {
            pool,
            frames: FrameTable::new(),
            swap,
        })
    }

    pub fn shutdown(self) {
        let (total, free, _) = self.pool.stats();
        log::info!(
            "VM core shutdown: {}/{} frames free, {} swap slots in use",
            free,
            total,
            self.swap.stats().used_slots
        );
    }
}
