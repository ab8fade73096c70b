// Swap Store
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::{VmError, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

/// Zero-based index of a page-sized slot on the swap device.
pub type SwapSlot = usize;

/// Raw block layer under the swap store. Sector size is fixed at 512 bytes.
pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> u64;
    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]);
    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]);
}

struct SwapInner<B> {
    device: B,
    bitmap: Vec<u64>,
    used_slots: usize,
}

/// Page-sized slot allocator over a block device.
///
/// One lock covers the slot bitmap and the device I/O, so a slot is never
/// visible to two swappers: allocation, the write, and release are atomic
/// with respect to each other.
pub struct SwapManager<B: BlockDevice> {
    total_slots: usize,
    inner: Mutex<SwapInner<B>>,
    swapped_out: AtomicU64,
    swapped_in: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapStats {
    pub total_slots: usize,
    pub used_slots: usize,
    pub swapped_out: u64,
    pub swapped_in: u64,
}

impl<B: BlockDevice> SwapManager<B> {
    /// Bind the store to its device. The capacity is however many whole
    /// pages fit on the device; a device too small for even one page is
    /// rejected.
    pub fn new(device: B) -> Result<Self, VmError> {
        let total_slots = (device.sector_count() / SECTORS_PER_PAGE as u64) as usize;
        if total_slots == 0 {
            return Err(VmError::NoSwapDevice);
        }
        log::info!(
            "Swap store ready: {} slots ({} KiB)",
            total_slots,
            total_slots * PAGE_SIZE / 1024
        );
        Ok(Self {
            total_slots,
            inner: Mutex::new(SwapInner {
                device,
                bitmap: vec![0; (total_slots + 63) / 64],
                used_slots: 0,
            }),
            swapped_out: AtomicU64::new(0),
            swapped_in: AtomicU64::new(0),
        })
    }

    fn scan_free(bitmap: &[u64], total: usize) -> Option<usize> {
        for (word_index, word) in bitmap.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let slot = word_index * 64 + (!*word).trailing_zeros() as usize;
            if slot < total {
                return Some(slot);
            }
        }
        None
    }

    /// Write one page into any free slot and return its index.
    pub fn swap_out(&self, page: &[u8]) -> Result<SwapSlot, VmError> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let mut inner = self.inner.lock();
        let slot = match Self::scan_free(&inner.bitmap, self.total_slots) {
            Some(slot) => slot,
            None => return Err(VmError::SwapExhausted),
        };
        inner.bitmap[slot / 64] |= 1 << (slot % 64);
        inner.used_slots += 1;
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            sector.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            inner
                .device
                .write_sector((slot * SECTORS_PER_PAGE + i) as u64, &sector);
        }
        self.swapped_out.fetch_add(1, Ordering::Relaxed);
        log::debug!("Swapped page out to slot {}", slot);
        Ok(slot)
    }

    /// Read the page stored in `slot` and release the slot. The slot must
    /// currently be in use.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), VmError> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let mut inner = self.inner.lock();
        if slot >= self.total_slots || inner.bitmap[slot / 64] & (1 << (slot % 64)) == 0 {
            return Err(VmError::InvalidSlot);
        }
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            inner
                .device
                .read_sector((slot * SECTORS_PER_PAGE + i) as u64, &mut sector);
            page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector);
        }
        inner.bitmap[slot / 64] &= !(1 << (slot % 64));
        inner.used_slots -= 1;
        self.swapped_in.fetch_add(1, Ordering::Relaxed);
        log::debug!("Swapped page in from slot {}", slot);
        Ok(())
    }

    /// Release a slot without reading it back.
    pub fn free_slot(&self, slot: SwapSlot) {
        if slot >= self.total_slots {
            return;
        }
        let mut inner = self.inner.lock();
        let (word, bit) = (slot / 64, slot % 64);
        if inner.bitmap[word] & (1 << bit) != 0 {
            inner.bitmap[word] &= !(1 << bit);
            inner.used_slots -= 1;
        }
    }

    pub fn slot_in_use(&self, slot: SwapSlot) -> bool {
        if slot >= self.total_slots {
            return false;
        }
        self.inner.lock().bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    pub fn stats(&self) -> SwapStats {
        let inner = self.inner.lock();
        SwapStats {
            total_slots: self.total_slots,
            used_slots: inner.used_slots,
            swapped_out: self.swapped_out.load(Ordering::Relaxed),
            swapped_in: self.swapped_in.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::MemDisk;

    fn pattern_page(seed: u8) -> Vec<u8> {
        (0..PAGE_SIZE)
            .map(|i| seed.wrapping_add(i as u8))
            .collect()
    }

    #[test]
    fn page_round_trips_and_slot_is_released() {
        let swap = SwapManager::new(MemDisk::new(4 * SECTORS_PER_PAGE)).unwrap();
        let page = pattern_page(0x11);
        let slot = swap.swap_out(&page).unwrap();
        assert!(swap.slot_in_use(slot));

        let mut read_back = vec![0u8; PAGE_SIZE];
        swap.swap_in(slot, &mut read_back).unwrap();
        assert_eq!(read_back, page);
        assert!(!swap.slot_in_use(slot));
        assert_eq!(swap.stats().used_slots, 0);
    }

    #[test]
    fn distinct_pages_get_distinct_slots() {
        let swap = SwapManager::new(MemDisk::new(4 * SECTORS_PER_PAGE)).unwrap();
        let a = swap.swap_out(&pattern_page(1)).unwrap();
        let b = swap.swap_out(&pattern_page(2)).unwrap();
        assert_ne!(a, b);

        let mut page = vec![0u8; PAGE_SIZE];
        swap.swap_in(a, &mut page).unwrap();
        assert_eq!(page, pattern_page(1));
        swap.swap_in(b, &mut page).unwrap();
        assert_eq!(page, pattern_page(2));
    }

    #[test]
    fn exhaustion_is_reported_and_free_slot_recovers() {
        let swap = SwapManager::new(MemDisk::new(2 * SECTORS_PER_PAGE)).unwrap();
        let a = swap.swap_out(&pattern_page(1)).unwrap();
        let _b = swap.swap_out(&pattern_page(2)).unwrap();
        assert_eq!(swap.swap_out(&pattern_page(3)), Err(VmError::SwapExhausted));

        swap.free_slot(a);
        assert!(swap.swap_out(&pattern_page(3)).is_ok());
    }

    #[test]
    fn reading_a_free_slot_is_an_error() {
        let swap = SwapManager::new(MemDisk::new(2 * SECTORS_PER_PAGE)).unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        assert_eq!(swap.swap_in(0, &mut page), Err(VmError::InvalidSlot));
        assert_eq!(swap.swap_in(99, &mut page), Err(VmError::InvalidSlot));
    }

    #[test]
    fn undersized_device_is_rejected() {
        assert!(matches!(
            SwapManager::new(MemDisk::new(SECTORS_PER_PAGE - 1)),
            Err(VmError::NoSwapDevice)
        ));
    }
}
