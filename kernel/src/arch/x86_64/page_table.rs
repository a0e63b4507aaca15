// =============================================================================
// MinimalOS NextGen — x86_64 Page Table Infrastructure
// =============================================================================
//
// This module provides types and functions for manipulating x86_64 4-level
// page tables. It does NOT own or switch the active page tables — that is
// the boot glue's job (it inherits whatever Limine set up).
//
// x86_64 PAGING OVERVIEW:
//
//   Virtual addresses are translated through 4 levels of page tables:
//
//   PML4 (Level 4) → PDPT (Level 3) → PD (Level 2) → PT (Level 1) → Page
//
//   Each level is a 4 KiB table containing 512 entries (each 8 bytes).
//   Each entry holds:
//     - The physical address of the next-level table (or the final page)
//     - Permission flags (present, writable, user-accessible, etc.)
//     - Status flags (accessed, dirty)
//
//   ```text
//   63  62..52  51..12       11..9   8   7   6   5   4   3   2   1   0
//   ┌───┬──────┬────────────┬───────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//   │NXE│ Avail│ Phys Addr  │ Avail │ G │PS │ D │ A │PCD│PWT│U/S│R/W│ P │
//   └───┴──────┴────────────┴───────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//   ```
//
// ADDRESS EXTRACTION:
//   The physical address stored in an entry is bits 51:12 (40 bits).
//   Mask: 0x000F_FFFF_FFFF_F000
//
// W^X ENFORCEMENT:
//   A memory region should be either Writable or eXecutable, never both.
//   The NX (No-Execute) bit enables this.
// =============================================================================

use bitflags::bitflags;

use crate::arch::x86_64::cpu;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::pmm;

// =============================================================================
// Page Table Flags
// =============================================================================

bitflags! {
    /// x86_64 page table entry flags.
    ///
    /// These control the permissions and behaviour of mapped pages.
    /// The flags are applied hierarchically — the effective permissions
    /// are the intersection (most restrictive) of all levels.
    ///
    /// Convention: intermediate tables (PML4 → PD) should be permissive
    /// (PRESENT | WRITABLE | USER if needed), with restrictions applied
    /// at the leaf level (PT entry or huge-page PD entry).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Page is present in physical memory.
        const PRESENT       = 1 << 0;
        /// Page is writable. If clear, writes cause a page fault.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (Ring 3).
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Disable caching for this page.
        const NO_CACHE      = 1 << 4;
        /// CPU sets this bit on any access.
        const ACCESSED      = 1 << 5;
        /// CPU sets this bit on a write.
        const DIRTY         = 1 << 6;
        /// In PD entries: makes a 2 MiB huge page (skips PT level).
        const HUGE_PAGE     = 1 << 7;
        /// Global page — TLB entry survives CR3 switches.
        const GLOBAL        = 1 << 8;
        /// No-Execute (NX / XD). Instruction fetches cause a page fault.
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageTableFlags {
    /// Flags for an intermediate (non-leaf) page table entry.
    ///
    /// Intermediate entries should be maximally permissive because the
    /// effective permissions are the intersection of all levels.
    /// Restrictions are applied at the leaf.
    pub const INTERMEDIATE: Self = Self::PRESENT.union(Self::WRITABLE);

    /// Same as INTERMEDIATE but also allows user-mode access.
    pub const INTERMEDIATE_USER: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Builds the leaf flags for a mapping from the VMM's abstract
    /// `MapAttributes`.
    pub fn from_attrs(attrs: crate::memory::mapper::MapAttributes) -> Self {
        let mut flags = Self::PRESENT | Self::GLOBAL;
        if attrs.writable {
            flags |= Self::WRITABLE;
        }
        if !attrs.kernel {
            flags |= Self::USER;
        }
        if !attrs.cachable {
            flags |= Self::NO_CACHE;
        }
        if attrs.kernel {
            // Kernel data is never executable unless explicitly requested
            // by a higher layer; code sections override this themselves.
            flags |= Self::NO_EXECUTE;
        }
        flags
    }
}

// =============================================================================
// Page Table Entry
// =============================================================================

/// A single entry in an x86_64 page table.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

/// Mask for extracting the physical address from a page table entry.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

impl PageTableEntry {
    /// A non-present (zeroed) entry.
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    /// Returns `true` if this is a huge page entry (2 MiB or 1 GiB).
    #[inline]
    pub fn is_huge(self) -> bool {
        self.0 & PageTableFlags::HUGE_PAGE.bits() != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Sets this entry to map `addr` with the given `flags`.
    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        debug_assert!(addr.is_page_aligned(), "page table entry address must be page-aligned");
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE({} {:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(empty)")
        }
    }
}

// =============================================================================
// Page Table
// =============================================================================

/// A 4-level x86_64 page table: 512 entries, 8 bytes each, one page total.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    #[inline]
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    pub fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

// =============================================================================
// Error types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    AlreadyMapped,
    OutOfMemory,
    HugePageConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    NotMapped,
    HugePageConflict,
}

// =============================================================================
// Page table operations
// =============================================================================

/// Returns the physical address of the currently active PML4 (from CR3).
#[inline]
pub fn active_pml4() -> PhysAddr {
    PhysAddr::new(cpu::read_cr3() & ADDR_MASK)
}

/// Allocates a new zeroed page table from the physical memory manager.
pub fn new_table() -> Option<PhysAddr> {
    alloc_frame_zeroed()
}

fn alloc_frame_zeroed() -> Option<PhysAddr> {
    let frame = pmm::alloc()?;
    unsafe {
        core::ptr::write_bytes(frame.to_virt().as_mut_ptr::<u8>(), 0, crate::memory::address::PAGE_SIZE as usize);
    }
    Some(frame)
}

/// Maps a single 4 KiB virtual page to a physical frame.
///
/// # Safety
/// `pml4_phys` must point to a valid PML4 table accessible via HHDM. The
/// caller must ensure the mapping won't corrupt currently executing code
/// and must flush the TLB for `virt` afterwards.
pub unsafe fn map_page(
    pml4_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), MapError> {
    debug_assert!(virt.is_page_aligned());
    debug_assert!(phys.is_page_aligned());

    let indices = virt.page_table_indices();

    let inter_flags = if flags.contains(PageTableFlags::USER) {
        PageTableFlags::INTERMEDIATE_USER
    } else {
        PageTableFlags::INTERMEDIATE
    };

    let pml4 = unsafe { &mut *pml4_phys.to_virt().as_mut_ptr::<PageTable>() };
    let pdpt_phys = get_or_create_next_table(&mut pml4[indices[3] as usize], inter_flags)?;

    let pdpt = unsafe { &mut *pdpt_phys.to_virt().as_mut_ptr::<PageTable>() };
    let pdpt_entry = &pdpt[indices[2] as usize];
    if pdpt_entry.is_present() && pdpt_entry.is_huge() {
        return Err(MapError::HugePageConflict);
    }
    let pd_phys = get_or_create_next_table(&mut pdpt[indices[2] as usize], inter_flags)?;

    let pd = unsafe { &mut *pd_phys.to_virt().as_mut_ptr::<PageTable>() };
    let pd_entry = &pd[indices[1] as usize];
    if pd_entry.is_present() && pd_entry.is_huge() {
        return Err(MapError::HugePageConflict);
    }
    let pt_phys = get_or_create_next_table(&mut pd[indices[1] as usize], inter_flags)?;

    let pt = unsafe { &mut *pt_phys.to_virt().as_mut_ptr::<PageTable>() };
    let leaf = &mut pt[indices[0] as usize];

    if leaf.is_present() {
        return Err(MapError::AlreadyMapped);
    }

    leaf.set(phys, flags);
    Ok(())
}

/// Unmaps a single 4 KiB virtual page, returning the physical frame it was
/// mapped to. Does NOT free the frame.
///
/// # Safety
/// Same requirements as `map_page`.
pub unsafe fn unmap_page(pml4_phys: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
    debug_assert!(virt.is_page_aligned());

    let indices = virt.page_table_indices();

    let pml4 = unsafe { &*pml4_phys.to_virt().as_ptr::<PageTable>() };
    let pml4_entry = &pml4[indices[3] as usize];
    if !pml4_entry.is_present() {
        return Err(UnmapError::NotMapped);
    }

    let pdpt = unsafe { &*pml4_entry.addr().to_virt().as_ptr::<PageTable>() };
    let pdpt_entry = &pdpt[indices[2] as usize];
    if !pdpt_entry.is_present() {
        return Err(UnmapError::NotMapped);
    }
    if pdpt_entry.is_huge() {
        return Err(UnmapError::HugePageConflict);
    }

    let pd = unsafe { &*pdpt_entry.addr().to_virt().as_ptr::<PageTable>() };
    let pd_entry = &pd[indices[1] as usize];
    if !pd_entry.is_present() {
        return Err(UnmapError::NotMapped);
    }
    if pd_entry.is_huge() {
        return Err(UnmapError::HugePageConflict);
    }

    let pt = unsafe { &mut *pd_entry.addr().to_virt().as_mut_ptr::<PageTable>() };
    let leaf = &mut pt[indices[0] as usize];

    if !leaf.is_present() {
        return Err(UnmapError::NotMapped);
    }

    let phys = leaf.addr();
    leaf.clear();
    Ok(phys)
}

/// Translates a virtual address to its physical address by walking the
/// page tables rooted at `pml4_phys`.
pub fn translate(pml4_phys: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let indices = virt.page_table_indices();
    let offset = virt.page_offset() as u64;

    let pml4 = unsafe { &*pml4_phys.to_virt().as_ptr::<PageTable>() };
    let pml4_entry = &pml4[indices[3] as usize];
    if !pml4_entry.is_present() {
        return None;
    }

    let pdpt = unsafe { &*pml4_entry.addr().to_virt().as_ptr::<PageTable>() };
    let pdpt_entry = &pdpt[indices[2] as usize];
    if !pdpt_entry.is_present() {
        return None;
    }
    if pdpt_entry.is_huge() {
        let gib_offset = virt.as_u64() & 0x3FFF_FFFF;
        return Some(PhysAddr::new((pdpt_entry.addr().as_u64() & !0x3FFF_FFFF) + gib_offset));
    }

    let pd = unsafe { &*pdpt_entry.addr().to_virt().as_ptr::<PageTable>() };
    let pd_entry = &pd[indices[1] as usize];
    if !pd_entry.is_present() {
        return None;
    }
    if pd_entry.is_huge() {
        let mib_offset = virt.as_u64() & 0x1F_FFFF;
        return Some(PhysAddr::new((pd_entry.addr().as_u64() & !0x1F_FFFF) + mib_offset));
    }

    let pt = unsafe { &*pd_entry.addr().to_virt().as_ptr::<PageTable>() };
    let pt_entry = &pt[indices[0] as usize];
    if !pt_entry.is_present() {
        return None;
    }

    Some(PhysAddr::new(pt_entry.addr().as_u64() + offset))
}

/// Flushes the TLB entry for a single virtual address.
#[inline]
pub fn flush(virt: VirtAddr) {
    cpu::invlpg(virt.as_u64());
}

/// Flushes the entire TLB by reloading CR3.
///
/// # Safety
/// The current CR3 must still point to a valid PML4.
pub unsafe fn flush_all() {
    let cr3 = cpu::read_cr3();
    unsafe {
        cpu::write_cr3(cr3);
    }
}

// =============================================================================
// Internal helpers
// =============================================================================

/// If the entry is present, return the physical address it points to.
/// Otherwise, allocate a new zeroed page table, set the entry, and return
/// its address.
fn get_or_create_next_table(
    entry: &mut PageTableEntry,
    flags: PageTableFlags,
) -> Result<PhysAddr, MapError> {
    if entry.is_present() {
        Ok(entry.addr())
    } else {
        let frame = alloc_frame_zeroed().ok_or(MapError::OutOfMemory)?;
        entry.set(frame, flags);
        Ok(frame)
    }
}
