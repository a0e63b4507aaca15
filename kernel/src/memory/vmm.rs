// =============================================================================
// MinimalOS NextGen — Virtual Memory Manager (VMM)
// =============================================================================
//
// Owns a contiguous virtual range `[start, end)` at block (page) granularity,
// tracked by a `Bitmap`, and a map from starting virtual address to the
// `VmmAllocation` that reserved it. Every mapping change is delegated to a
// `Mapper` — the VMM never touches a page table directly, which is what
// makes it host-testable against `mapper::test_support::MockMapper`.
//
// The VMM does not own a `Pmm` — the physical frame manager is threaded
// through explicitly on every call that may allocate or free frames,
// mirroring the "no ambient allocator" discipline used everywhere else in
// the kernel. The real kernel binary always passes the global PMM; tests
// construct a fresh `Pmm` per case.
// =============================================================================

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::memory::address::VirtAddr;
use crate::memory::bitmap::Bitmap;
use crate::memory::mapper::{MapAttributes, MapError, Mapper};
use crate::memory::pmm::{Pmm, BLOCK_SIZE};

/// Errors produced by VMM operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// `n == 0`, the PMM is exhausted, or the VMM bitmap has no run of
    /// the requested size when no preferred address was given.
    OutOfMemory,
    /// A preferred address (or an explicit range) falls outside `[start, end)`.
    OutOfBounds,
    /// The requested virtual range (or the preferred address's run) is
    /// not entirely free.
    AlreadyAllocated,
    /// `free` was called with an address that keys no live allocation.
    NotAllocated,
    InvalidVirtAddresses,
    InvalidPhysAddresses,
    /// `VMM.set`'s virtual and physical ranges differ in size.
    PhysicalVirtualMismatch,
    /// `VMM.set`'s physical range overlaps frames already Reserved in the PMM.
    PhysicalAlreadyAllocated,
    /// The mapper rejected the operation; propagated unchanged.
    Mapper(MapError),
}

/// The bookkeeping record for one live reservation: how many blocks it
/// spans, and the physical frames it owns (empty if it was registered via
/// `set` with no physical backing).
struct VmmAllocation {
    blocks: usize,
    frames: Vec<crate::memory::address::PhysAddr>,
}

/// A per-address-space virtual region allocator bound to a `Mapper`.
pub struct VirtualMemoryManager<M: Mapper> {
    start: VirtAddr,
    end: VirtAddr,
    bitmap: Bitmap<u64>,
    allocations: BTreeMap<u64, VmmAllocation>,
    mapper: M,
    payload: M::Payload,
}

impl<M: Mapper> VirtualMemoryManager<M> {
    /// Creates a VMM over the half-open range `[start, end)`, entirely free.
    pub fn new(start: VirtAddr, end: VirtAddr, mapper: M, payload: M::Payload) -> Self {
        let num_entries = ((end - start) / BLOCK_SIZE) as usize;
        Self {
            start,
            end,
            bitmap: Bitmap::new(num_entries),
            allocations: BTreeMap::new(),
            mapper,
            payload,
        }
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn end(&self) -> VirtAddr {
        self.end
    }

    fn index_of(&self, addr: VirtAddr) -> Option<usize> {
        if addr < self.start {
            return None;
        }
        let index = ((addr - self.start) / BLOCK_SIZE) as usize;
        (index < self.bitmap.num_entries()).then_some(index)
    }

    fn addr_of(&self, index: usize) -> VirtAddr {
        self.start + (index as u64) * BLOCK_SIZE
    }

    /// Passes through to the bitmap: is the block containing `addr` Reserved?
    pub fn is_set(&self, addr: VirtAddr) -> Result<bool, VmmError> {
        let index = self.index_of(addr).ok_or(VmmError::OutOfBounds)?;
        self.bitmap.is_set(index).map_err(|_| VmmError::OutOfBounds)
    }

    /// Allocates `n` virtual blocks, each backed by a freshly PMM-allocated
    /// physical frame (frames need not be contiguous).
    ///
    /// `preferred_addr`, if given, pins the allocation to start exactly
    /// there (used by the ELF loader to place sections at their link
    /// addresses); otherwise the lowest free run is used.
    pub fn alloc(
        &mut self,
        n: usize,
        preferred_addr: Option<VirtAddr>,
        attrs: MapAttributes,
        pmm: &mut Pmm,
    ) -> Result<VirtAddr, VmmError> {
        if n == 0 {
            return Err(VmmError::OutOfMemory);
        }
        if pmm.blocks_free() < n {
            return Err(VmmError::OutOfMemory);
        }

        let from = match preferred_addr {
            Some(addr) => {
                let aligned = addr.page_align_down();
                let index = self.index_of(aligned).ok_or(VmmError::OutOfBounds)?;
                if index + n > self.bitmap.num_entries() {
                    return Err(VmmError::OutOfBounds);
                }
                Some(index)
            }
            None => {
                if self.bitmap.num_free_entries() < n {
                    return Err(VmmError::OutOfMemory);
                }
                None
            }
        };

        let start_index = self.bitmap.set_contiguous(n, from).ok_or_else(|| {
            if preferred_addr.is_some() {
                VmmError::AlreadyAllocated
            } else {
                VmmError::OutOfMemory
            }
        })?;
        let v_start = self.addr_of(start_index);

        let mut mapped_frames = Vec::with_capacity(n);
        let mut failure = None;

        for i in 0..n {
            let v = v_start + (i as u64) * BLOCK_SIZE;
            match pmm.alloc() {
                None => {
                    failure = Some(VmmError::OutOfMemory);
                    break;
                }
                Some(frame) => {
                    let result = unsafe {
                        self.mapper
                            .map(v, v + BLOCK_SIZE, frame, frame + BLOCK_SIZE, attrs, self.payload)
                    };
                    match result {
                        Ok(()) => mapped_frames.push(frame),
                        Err(e) => {
                            let _ = pmm.free(frame);
                            failure = Some(VmmError::Mapper(e));
                            break;
                        }
                    }
                }
            }
        }

        if let Some(err) = failure {
            for (i, frame) in mapped_frames.iter().enumerate() {
                let v = v_start + (i as u64) * BLOCK_SIZE;
                let _ = unsafe { self.mapper.unmap(v, v + BLOCK_SIZE, self.payload) };
                let _ = pmm.free(*frame);
            }
            for i in 0..n {
                let _ = self.bitmap.clear(start_index + i);
            }
            return Err(err);
        }

        self.allocations.insert(
            v_start.as_u64(),
            VmmAllocation { blocks: n, frames: mapped_frames },
        );
        Ok(v_start)
    }

    /// Pre-declares a known region (kernel image, framebuffer, boot-reserved
    /// ranges) optionally backed by a specific physical range.
    pub fn set(
        &mut self,
        v_start: VirtAddr,
        v_end: VirtAddr,
        physical: Option<(crate::memory::address::PhysAddr, crate::memory::address::PhysAddr)>,
        attrs: MapAttributes,
        pmm: &mut Pmm,
    ) -> Result<(), VmmError> {
        if v_start > v_end {
            return Err(VmmError::InvalidVirtAddresses);
        }
        let start_index = self.index_of(v_start).ok_or(VmmError::InvalidVirtAddresses)?;
        let n = ((v_end - v_start) / BLOCK_SIZE) as usize;
        if start_index + n > self.bitmap.num_entries() {
            return Err(VmmError::InvalidVirtAddresses);
        }
        for i in 0..n {
            if self.bitmap.is_set(start_index + i).unwrap_or(true) {
                return Err(VmmError::AlreadyAllocated);
            }
        }

        if let Some((p_start, p_end)) = physical {
            if p_start > p_end {
                return Err(VmmError::InvalidPhysAddresses);
            }
            if (p_end - p_start) != (v_end - v_start) {
                return Err(VmmError::PhysicalVirtualMismatch);
            }
            let mut frame = p_start;
            while frame < p_end {
                if pmm.is_set(frame).unwrap_or(true) {
                    return Err(VmmError::PhysicalAlreadyAllocated);
                }
                frame = frame + BLOCK_SIZE;
            }

            for i in 0..n {
                let _ = self.bitmap.set(start_index + i);
            }

            if let Err(e) = unsafe { self.mapper.map(v_start, v_end, p_start, p_end, attrs, self.payload) } {
                for i in 0..n {
                    let _ = self.bitmap.clear(start_index + i);
                }
                return Err(VmmError::Mapper(e));
            }

            let mut frames = Vec::with_capacity(n);
            let mut frame = p_start;
            while frame < p_end {
                let _ = pmm.set_addr(frame);
                frames.push(frame);
                frame = frame + BLOCK_SIZE;
            }
            self.allocations.insert(v_start.as_u64(), VmmAllocation { blocks: n, frames });
        } else {
            for i in 0..n {
                let _ = self.bitmap.set(start_index + i);
            }
            self.allocations
                .insert(v_start.as_u64(), VmmAllocation { blocks: n, frames: Vec::new() });
        }

        Ok(())
    }

    /// Releases a live allocation: frees every owned physical frame, clears
    /// the corresponding VMM bits, and unmaps the whole contiguous range.
    ///
    /// A partial `unmap` failure is treated as fatal (the mapper is
    /// expected to be total over a range the VMM owns).
    pub fn free(&mut self, v_start: VirtAddr, pmm: &mut Pmm) -> Result<(), VmmError> {
        let allocation = self
            .allocations
            .remove(&v_start.as_u64())
            .ok_or(VmmError::NotAllocated)?;

        let start_index = self.index_of(v_start).ok_or(VmmError::OutOfBounds)?;
        for i in 0..allocation.blocks {
            let _ = self.bitmap.clear(start_index + i);
        }
        for frame in &allocation.frames {
            pmm.free(*frame).expect("VMM: owned frame was not Reserved in the PMM");
        }

        let v_end = v_start + (allocation.blocks as u64) * BLOCK_SIZE;
        unsafe { self.mapper.unmap(v_start, v_end, self.payload) }
            .expect("VMM: unmap failed over a range the VMM owns — fatal");

        Ok(())
    }

    /// Finds the physical frame backing `vaddr`, if any live allocation in
    /// this VMM covers it.
    fn physical_for(&self, vaddr: VirtAddr) -> Option<crate::memory::address::PhysAddr> {
        let (&key, allocation) = self.allocations.range(..=vaddr.as_u64()).next_back()?;
        let region_end = key + (allocation.blocks as u64) * BLOCK_SIZE;
        if vaddr.as_u64() >= region_end || allocation.frames.is_empty() {
            return None;
        }
        let block_index = ((vaddr.as_u64() - key) / BLOCK_SIZE) as usize;
        let offset = vaddr.as_u64() % BLOCK_SIZE;
        Some(allocation.frames[block_index] + offset)
    }

    /// Copies `bytes` between a plain kernel-owned buffer and `other_vaddr`
    /// in `other`'s address space, one page-sized chunk at a time (frames
    /// backing a multi-block region need not be contiguous).
    ///
    /// `to_other == true` writes `bytes` into `other`; `false` reads from
    /// `other` into `bytes`.
    pub fn copy_data(
        &self,
        other: &Self,
        to_other: bool,
        bytes: &mut [u8],
        other_vaddr: VirtAddr,
    ) -> Result<(), VmmError> {
        let mut done = 0usize;
        while done < bytes.len() {
            let vaddr = other_vaddr + done as u64;
            let phys = other.physical_for(vaddr).ok_or(VmmError::NotAllocated)?;
            let chunk = core::cmp::min(
                bytes.len() - done,
                (BLOCK_SIZE - (vaddr.as_u64() % BLOCK_SIZE)) as usize,
            );
            let virt_ptr = phys.to_virt().as_mut_ptr::<u8>();
            unsafe {
                if to_other {
                    core::ptr::copy_nonoverlapping(bytes.as_ptr().add(done), virt_ptr, chunk);
                } else {
                    core::ptr::copy_nonoverlapping(virt_ptr, bytes.as_mut_ptr().add(done), chunk);
                }
            }
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address::PhysAddr;
    use crate::memory::mapper::test_support::MockMapper;
    use crate::memory::profile::{MemoryProfile, PhysicalReservation};

    fn pmm_with_blocks(n: u64) -> Pmm {
        let profile = MemoryProfile {
            vaddr_start: VirtAddr::zero(),
            vaddr_end: VirtAddr::zero(),
            physaddr_start: PhysAddr::zero(),
            physaddr_end: PhysAddr::new(n * BLOCK_SIZE),
            mem_kb: n * BLOCK_SIZE / 1024,
            virtual_reserved: alloc::vec![],
            physical_reserved: alloc::vec![],
            modules: alloc::vec![],
        };
        Pmm::new(&profile)
    }

    fn test_vmm(blocks: u64) -> VirtualMemoryManager<MockMapper> {
        VirtualMemoryManager::new(
            VirtAddr::zero(),
            VirtAddr::new(blocks * BLOCK_SIZE),
            MockMapper::new(),
            0,
        )
    }

    /// Scenario 3: VMM set vs alloc conflict.
    #[test]
    fn set_vs_alloc_conflict_scenario() {
        let mut vmm = test_vmm(32);
        let mut pmm = pmm_with_blocks(32);
        let attrs = MapAttributes { kernel: true, writable: true, cachable: true };

        vmm.set(
            VirtAddr::new(4 * BLOCK_SIZE),
            VirtAddr::new(8 * BLOCK_SIZE),
            Some((PhysAddr::new(4 * BLOCK_SIZE), PhysAddr::new(8 * BLOCK_SIZE))),
            attrs,
            &mut pmm,
        )
        .unwrap();

        let a = vmm.alloc(3, None, attrs, &mut pmm).unwrap();
        assert_eq!(a, VirtAddr::zero());

        let b = vmm.alloc(5, None, attrs, &mut pmm).unwrap();
        assert_eq!(b, VirtAddr::new(8 * BLOCK_SIZE));
    }

    /// Scenario 4: VMM rollback on mapper failure. The mapper fails on the
    /// third block (index 2) of a 4-block alloc.
    #[test]
    fn rollback_on_mapper_failure_scenario() {
        let mut vmm = VirtualMemoryManager::new(
            VirtAddr::zero(),
            VirtAddr::new(32 * BLOCK_SIZE),
            MockMapper::failing_on_block(2),
            0,
        );
        let mut pmm = pmm_with_blocks(32);
        let attrs = MapAttributes::default();

        let frames_before = pmm.blocks_free();
        let bits_before = vmm.is_set(VirtAddr::zero());

        let result = vmm.alloc(4, None, attrs, &mut pmm);
        assert_eq!(result, Err(VmmError::Mapper(MapError::OutOfMemory)));

        assert_eq!(pmm.blocks_free(), frames_before);
        assert_eq!(vmm.is_set(VirtAddr::zero()), bits_before);
        for i in 0..4u64 {
            assert_eq!(vmm.is_set(VirtAddr::new(i * BLOCK_SIZE)), Ok(false));
        }
    }

    #[test]
    fn alloc_then_free_is_idempotent() {
        let mut vmm = test_vmm(16);
        let mut pmm = pmm_with_blocks(16);
        let attrs = MapAttributes::default();

        let frames_before = pmm.blocks_free();
        let addr = vmm.alloc(4, None, attrs, &mut pmm).unwrap();
        assert_eq!(pmm.blocks_free(), frames_before - 4);

        vmm.free(addr, &mut pmm).unwrap();
        assert_eq!(pmm.blocks_free(), frames_before);
        for i in 0..4u64 {
            assert_eq!(vmm.is_set(VirtAddr::new(i * BLOCK_SIZE)), Ok(false));
        }
    }

    #[test]
    fn free_on_unknown_address_is_an_error() {
        let mut vmm = test_vmm(4);
        let mut pmm = pmm_with_blocks(4);
        assert_eq!(vmm.free(VirtAddr::new(BLOCK_SIZE), &mut pmm), Err(VmmError::NotAllocated));
    }

    #[test]
    fn preferred_addr_crossing_end_is_out_of_bounds() {
        let mut vmm = test_vmm(4);
        let mut pmm = pmm_with_blocks(4);
        let attrs = MapAttributes::default();
        let result = vmm.alloc(2, Some(VirtAddr::new(3 * BLOCK_SIZE)), attrs, &mut pmm);
        assert_eq!(result, Err(VmmError::OutOfBounds));
    }

    #[test]
    fn copy_data_writes_across_a_single_block() {
        crate::memory::address::test_support::init_test_hhdm();
        let mut vmm = test_vmm(4);
        let mut pmm = pmm_with_blocks(4);
        let attrs = MapAttributes::default();
        let addr = vmm.alloc(1, None, attrs, &mut pmm).unwrap();

        let mut src = [0xABu8; 16];
        vmm.copy_data(&vmm, true, &mut src, addr).unwrap();

        let mut dst = [0u8; 16];
        vmm.copy_data(&vmm, false, &mut dst, addr).unwrap();
        assert_eq!(dst, [0xABu8; 16]);
    }
}
