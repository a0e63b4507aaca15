// =============================================================================
// MinimalOS NextGen — x86_64 Mapper
// =============================================================================
//
// The concrete `Mapper` implementation the VMM uses on real hardware: its
// `Payload` is the physical address of a PML4 root, and `map`/`unmap`
// drive the page-table walker in `page_table` one block at a time.

use crate::arch::x86_64::page_table::{self, PageTableFlags};
use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::mapper::{MapAttributes, MapError, Mapper, UnmapError};

/// Drives the x86_64 4-level page table walker on behalf of the VMM.
///
/// Stateless — everything it needs (the table root) arrives as the
/// `payload` of each call, so one `X86PageTableMapper` can serve every
/// address space in the system.
pub struct X86PageTableMapper;

impl X86PageTableMapper {
    pub const fn new() -> Self {
        Self
    }
}

impl Mapper for X86PageTableMapper {
    type Payload = PhysAddr;

    unsafe fn map(
        &self,
        v_start: VirtAddr,
        v_end: VirtAddr,
        p_start: PhysAddr,
        p_end: PhysAddr,
        attrs: MapAttributes,
        payload: PhysAddr,
    ) -> Result<(), MapError> {
        if !v_start.is_page_aligned() {
            return Err(MapError::MisalignedVirtualAddress);
        }
        if !p_start.is_page_aligned() {
            return Err(MapError::MisalignedPhysicalAddress);
        }
        if v_end < v_start {
            return Err(MapError::InvalidVirtualAddress);
        }
        if p_end < p_start {
            return Err(MapError::InvalidPhysicalAddress);
        }
        if (v_end - v_start) != (p_end - p_start) {
            return Err(MapError::AddressMismatch);
        }

        let flags = PageTableFlags::from_attrs(attrs);
        let n = (v_end - v_start) / PAGE_SIZE;

        for i in 0..n {
            let v = v_start + i * PAGE_SIZE;
            let p = p_start + i * PAGE_SIZE;
            unsafe { page_table::map_page(payload, v, p, flags) }.map_err(|e| match e {
                page_table::MapError::OutOfMemory => MapError::OutOfMemory,
                page_table::MapError::AlreadyMapped => MapError::InvalidVirtualAddress,
                page_table::MapError::HugePageConflict => MapError::InvalidVirtualAddress,
            })?;
            page_table::flush(v);
        }
        Ok(())
    }

    unsafe fn unmap(
        &self,
        v_start: VirtAddr,
        v_end: VirtAddr,
        payload: PhysAddr,
    ) -> Result<(), UnmapError> {
        let n = (v_end - v_start) / PAGE_SIZE;
        for i in 0..n {
            let v = v_start + i * PAGE_SIZE;
            unsafe { page_table::unmap_page(payload, v) }.map_err(|_| UnmapError::NotMapped)?;
            page_table::flush(v);
        }
        Ok(())
    }
}
