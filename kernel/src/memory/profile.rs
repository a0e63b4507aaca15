// =============================================================================
// MinimalOS NextGen — Memory Profile
// =============================================================================
//
// Everything the PMM and VMM need to know about the machine's memory
// layout, distilled from whatever the bootloader handed us. Keeping this
// as a plain, bootloader-agnostic struct means the PMM/VMM constructors
// take a `&MemoryProfile` rather than a `&[limine::memory_map::Entry]`,
// which is what makes them constructible (and testable) on the host.
//
// `arch::x86_64::boot` is the only module that knows how to build one of
// these from Limine's responses.

use crate::memory::address::{PhysAddr, VirtAddr};
use alloc::vec::Vec;

/// A virtual region, with an optional physical backing (identity-ish
/// mappings already established by the bootloader, such as the kernel
/// image itself).
#[derive(Debug, Clone, Copy)]
pub struct VirtualReservation {
    pub virtual_start: VirtAddr,
    pub virtual_end: VirtAddr,
    pub physical: Option<(PhysAddr, PhysAddr)>,
}

/// A physical region already spoken for before the PMM gets a chance to
/// hand it out — bootloader-reclaimable memory, ACPI tables, the kernel
/// image's physical frames, framebuffer memory, and so on.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalReservation {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

/// A bootloader-provided module (an initrd, a font, anything loaded
/// alongside the kernel image) and the physical range it occupies.
#[derive(Debug, Clone)]
pub struct ModuleReservation {
    pub region: PhysicalReservation,
    pub name: Vec<u8>,
}

/// A bootloader-agnostic description of the machine's memory layout,
/// built once at boot and handed to the PMM and VMM constructors.
#[derive(Debug, Clone)]
pub struct MemoryProfile {
    /// Start of the higher-half direct map of all physical memory.
    pub vaddr_start: VirtAddr,
    /// End of the higher-half direct map.
    pub vaddr_end: VirtAddr,
    /// Lowest physical address known to exist.
    pub physaddr_start: PhysAddr,
    /// Highest physical address known to exist (exclusive).
    pub physaddr_end: PhysAddr,
    /// Total installed memory, in KiB, as reported by the bootloader.
    pub mem_kb: u64,
    /// Virtual ranges already mapped before the VMM takes over (kernel
    /// image, HHDM window, bootloader reclaimable regions still mapped).
    pub virtual_reserved: Vec<VirtualReservation>,
    /// Physical ranges the PMM must never hand out.
    pub physical_reserved: Vec<PhysicalReservation>,
    /// Bootloader-provided modules.
    pub modules: Vec<ModuleReservation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> MemoryProfile {
        MemoryProfile {
            vaddr_start: VirtAddr::new_unchecked(0xFFFF_8000_0000_0000),
            vaddr_end: VirtAddr::new_unchecked(0xFFFF_C000_0000_0000),
            physaddr_start: PhysAddr::zero(),
            physaddr_end: PhysAddr::new_unchecked(0x1_0000_0000),
            mem_kb: 4 * 1024 * 1024,
            virtual_reserved: alloc::vec![],
            physical_reserved: alloc::vec![PhysicalReservation {
                start: PhysAddr::zero(),
                end: PhysAddr::new_unchecked(0x10_0000),
            }],
            modules: alloc::vec![],
        }
    }

    #[test]
    fn profile_is_constructible_without_a_bootloader() {
        let profile = sample_profile();
        assert_eq!(profile.physical_reserved.len(), 1);
        assert_eq!(profile.mem_kb, 4 * 1024 * 1024);
    }
}
