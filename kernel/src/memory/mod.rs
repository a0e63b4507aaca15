// =============================================================================
// MinimalOS NextGen — Memory Subsystem
// =============================================================================
//
// The memory subsystem manages all physical and virtual memory in the kernel.
// It's organized bottom-up, each layer built only on the ones below it:
//
//   address.rs  — PhysAddr/VirtAddr newtypes (type safety for addresses)
//   bitmap.rs   — generic set/clear/first-free/contiguous bit bookkeeping
//   profile.rs  — bootloader-agnostic memory layout (PMM/VMM's only input)
//   mapper.rs   — the Mapper trait the VMM drives to install page mappings
//   pmm.rs      — Physical Memory Manager (bitmap allocator for frames)
//   vmm.rs      — Virtual Memory Manager (virtual regions bound to a Mapper)
//   heap.rs     — kernel heap: free-list byte allocator over a VMM region
//
// This module only exposes what's needed. Internal details stay private.
// =============================================================================

pub mod address;
pub mod bitmap;
pub mod heap;
pub mod mapper;
pub mod pmm;
pub mod profile;
pub mod vmm;

