// =============================================================================
// MinimalOS NextGen — Physical Memory Manager (PMM)
// =============================================================================
//
// Tracks every physical page frame in the machine as one bit in a bitmap:
// 0 = free, 1 = reserved. `BLOCK_SIZE` is the architecture's page frame
// size; on x86_64 that's 4 KiB.
//
// The PMM itself knows nothing about Limine, memory maps, or any other
// bootloader detail — it is constructed from a `MemoryProfile`, which is
// exactly what lets `Pmm::new` run under `cargo test` on the host. The
// `static PMM` wrapper below is the only bootloader-facing surface, used
// by the real kernel binary; tests construct `Pmm` instances directly.
// =============================================================================

use crate::memory::address::{PhysAddr, PAGE_SIZE};
use crate::memory::bitmap::{Bitmap, OutOfBounds};
use crate::memory::profile::MemoryProfile;
use crate::sync::spinlock::SpinLock;

/// The unit of PMM and VMM allocation. Equal to the architecture's page
/// frame size.
pub const BLOCK_SIZE: u64 = PAGE_SIZE;

/// Errors produced by PMM operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// The address does not correspond to a frame tracked by this PMM
    /// (below `physaddr_start`, at/above `physaddr_end`, or misaligned).
    OutOfBounds,
    /// `free` was called on a frame that is not currently Reserved.
    NotAllocated,
}

impl From<OutOfBounds> for PmmError {
    fn from(_: OutOfBounds) -> Self {
        PmmError::OutOfBounds
    }
}

/// A snapshot of PMM utilisation, useful for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
}

/// A bitmap-backed physical frame allocator over `[base, base + total_frames * BLOCK_SIZE)`.
pub struct Pmm {
    bitmap: Bitmap<u64>,
    base: PhysAddr,
}

impl Pmm {
    /// Builds a PMM from a memory profile: sizes the bitmap to cover
    /// `[physaddr_start, physaddr_end)`, then marks every physically
    /// reserved range Reserved, rounding each range OUTWARD to block
    /// boundaries. Ranges (or parts of ranges) beyond `physaddr_end` are
    /// silently ignored — the bitmap simply rejects them as out of bounds.
    pub fn new(profile: &MemoryProfile) -> Self {
        let base = profile.physaddr_start;
        let total_bytes = profile.physaddr_end - base;
        let total_frames = (total_bytes / BLOCK_SIZE) as usize;
        let mut bitmap = Bitmap::new(total_frames);

        for reserved in &profile.physical_reserved {
            let start = reserved.start.page_align_down();
            let end = reserved.end.page_align_up();
            let mut addr = start;
            while addr < end {
                if let Ok(index) = Self::index_of(base, total_frames, addr) {
                    // Bounds already checked by index_of; set() cannot fail.
                    let _ = bitmap.set(index);
                }
                addr = addr + BLOCK_SIZE;
            }
        }

        Self { bitmap, base }
    }

    fn index_of(base: PhysAddr, total_frames: usize, addr: PhysAddr) -> Result<usize, PmmError> {
        if addr < base || !addr.is_page_aligned() {
            return Err(PmmError::OutOfBounds);
        }
        let index = ((addr - base) / BLOCK_SIZE) as usize;
        if index >= total_frames {
            return Err(PmmError::OutOfBounds);
        }
        Ok(index)
    }

    fn addr_of(&self, index: usize) -> PhysAddr {
        self.base + (index as u64) * BLOCK_SIZE
    }

    /// Allocates the first free frame, or returns `None` on exhaustion.
    /// Never panics — callers decide how to react to exhaustion.
    pub fn alloc(&mut self) -> Option<PhysAddr> {
        let index = self.bitmap.set_first_free()?;
        Some(self.addr_of(index))
    }

    /// Frees a previously allocated frame.
    ///
    /// # Errors
    /// `NotAllocated` if the frame is not currently Reserved — a
    /// programmer error, which callers typically escalate to a panic.
    pub fn free(&mut self, addr: PhysAddr) -> Result<(), PmmError> {
        let index = Self::index_of(self.base, self.bitmap.num_entries(), addr)?;
        if !self.bitmap.is_set(index).unwrap_or(false) {
            return Err(PmmError::NotAllocated);
        }
        self.bitmap.clear(index).map_err(PmmError::from)
    }

    /// Marks a specific frame Reserved (used by `VMM.set` for
    /// pre-declared regions with a known physical backing).
    pub fn set_addr(&mut self, addr: PhysAddr) -> Result<(), PmmError> {
        let index = Self::index_of(self.base, self.bitmap.num_entries(), addr)?;
        self.bitmap.set(index).map_err(PmmError::from)
    }

    /// Reports whether a given frame is currently Reserved.
    pub fn is_set(&self, addr: PhysAddr) -> Result<bool, PmmError> {
        let index = Self::index_of(self.base, self.bitmap.num_entries(), addr)?;
        self.bitmap.is_set(index).map_err(PmmError::from)
    }

    /// Number of currently-free frames.
    pub fn blocks_free(&self) -> usize {
        self.bitmap.num_free_entries()
    }

    pub fn stats(&self) -> MemoryStats {
        let total_frames = self.bitmap.num_entries();
        let free_frames = self.bitmap.num_free_entries();
        MemoryStats {
            total_frames,
            used_frames: total_frames - free_frames,
            free_frames,
        }
    }
}

// =============================================================================
// Global singleton (kernel binary only — tests construct `Pmm` directly)
// =============================================================================

static PMM: SpinLock<Option<Pmm>> = SpinLock::new(None);

/// Initialises the global PMM from the boot-time memory profile.
///
/// # Panics
/// Panics if called more than once.
pub fn init(profile: &MemoryProfile) {
    let mut guard = PMM.lock();
    assert!(guard.is_none(), "PMM: already initialized");
    *guard = Some(Pmm::new(profile));
}

/// Runs `f` against the global PMM. Exposed so boot-time setup (the only
/// caller outside this module) can thread a genuine `&mut Pmm` through the
/// `VirtualMemoryManager`/`Task` calls that need one explicitly, instead
/// of each going through its own single-call wrapper below.
pub fn with_pmm<R>(f: impl FnOnce(&mut Pmm) -> R) -> R {
    let mut guard = PMM.lock();
    let pmm = guard.as_mut().expect("PMM: not initialized — call pmm::init() first");
    f(pmm)
}

pub fn alloc() -> Option<PhysAddr> {
    with_pmm(|pmm| pmm.alloc())
}

pub fn free(addr: PhysAddr) -> Result<(), PmmError> {
    with_pmm(|pmm| pmm.free(addr))
}

pub fn set_addr(addr: PhysAddr) -> Result<(), PmmError> {
    with_pmm(|pmm| pmm.set_addr(addr))
}

pub fn is_set(addr: PhysAddr) -> Result<bool, PmmError> {
    with_pmm(|pmm| pmm.is_set(addr))
}

pub fn blocks_free() -> usize {
    with_pmm(|pmm| pmm.blocks_free())
}

pub fn stats() -> MemoryStats {
    with_pmm(|pmm| pmm.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address::VirtAddr;
    use alloc::vec::Vec;
    use alloc::vec;

    fn profile_with(total_blocks: u64, reserved: Vec<(u64, u64)>) -> MemoryProfile {
        MemoryProfile {
            vaddr_start: VirtAddr::zero(),
            vaddr_end: VirtAddr::zero(),
            physaddr_start: PhysAddr::zero(),
            physaddr_end: PhysAddr::new(total_blocks * BLOCK_SIZE),
            mem_kb: total_blocks * BLOCK_SIZE / 1024,
            virtual_reserved: vec![],
            physical_reserved: reserved
                .into_iter()
                .map(|(s, e)| crate::memory::profile::PhysicalReservation {
                    start: PhysAddr::new(s),
                    end: PhysAddr::new(e),
                })
                .collect(),
            modules: vec![],
        }
    }

    /// Scenario 2: PMM isolation.
    #[test]
    fn isolation_scenario() {
        let profile = profile_with(32, vec![]);
        let mut pmm = Pmm::new(&profile);

        let mut addrs = Vec::new();
        for _ in 0..32 {
            addrs.push(pmm.alloc().expect("frame available"));
        }
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(addr.as_u64(), i as u64 * BLOCK_SIZE);
        }
        assert_eq!(pmm.alloc(), None);

        pmm.free(PhysAddr::zero()).unwrap();
        assert_eq!(pmm.alloc(), Some(PhysAddr::zero()));
    }

    #[test]
    fn reserved_ranges_are_rounded_outward() {
        // A 1-byte reservation at offset BLOCK_SIZE + 1 must reserve the
        // entire second block, not just one byte of it.
        let profile = profile_with(4, vec![(BLOCK_SIZE + 1, BLOCK_SIZE + 2)]);
        let pmm = Pmm::new(&profile);
        assert!(pmm.is_set(PhysAddr::new(BLOCK_SIZE)).unwrap());
        assert_eq!(pmm.blocks_free(), 3);
    }

    #[test]
    fn free_on_unallocated_frame_is_an_error() {
        let profile = profile_with(4, vec![]);
        let mut pmm = Pmm::new(&profile);
        assert_eq!(pmm.free(PhysAddr::zero()), Err(PmmError::NotAllocated));
    }

    #[test]
    fn out_of_range_address_is_rejected() {
        let profile = profile_with(4, vec![]);
        let pmm = Pmm::new(&profile);
        assert_eq!(
            pmm.is_set(PhysAddr::new(100 * BLOCK_SIZE)),
            Err(PmmError::OutOfBounds)
        );
    }
}
