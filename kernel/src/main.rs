#![no_std]
#![no_main]

// The real subsystems all live in the library half of this crate
// (`minimalos_kernel`) so they can be unit-tested on the host; this
// binary is just the Limine entry point that wires them together.

use limine::BaseRevision;

use minimalos_kernel::arch::x86_64::boot;
use minimalos_kernel::arch::x86_64::cpu;
use minimalos_kernel::arch::x86_64::mapper::X86PageTableMapper;
use minimalos_kernel::arch::x86_64::page_table;
use minimalos_kernel::memory::address::{self, VirtAddr};
use minimalos_kernel::memory::heap;
use minimalos_kernel::memory::mapper::MapAttributes;
use minimalos_kernel::memory::pmm;
use minimalos_kernel::memory::vmm::VirtualMemoryManager;
use minimalos_kernel::task::scheduler;
use minimalos_kernel::{kprintln, util::logger};

#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// Virtual window reserved for the kernel's own dynamic allocations (the
/// heap, and any future kernel-task VMM use) — deliberately disjoint
/// from wherever Limine loaded the kernel image or mapped the HHDM, so
/// this VMM never has to reason about either.
const KERNEL_VMM_BASE: u64 = 0xFFFF_C000_0000_0000;
const KERNEL_VMM_SIZE: u64 = 1 << 30; // 1 GiB

/// The idle task is a kernel task and shares the kernel's page tables;
/// it gets its own (effectively unused) virtual window purely so it can
/// own a `VirtualMemoryManager` of its own, disjoint from the kernel's.
const IDLE_VMM_BASE: u64 = KERNEL_VMM_BASE + KERNEL_VMM_SIZE;
const IDLE_VMM_SIZE: u64 = 1 << 20; // 1 MiB

/// Bytes carved out of the kernel VMM for the free-list byte allocator.
const KERNEL_HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Limine guarantees at least this much stack before calling `_start`
/// (the boot protocol's minimum); the boot task adopts whatever stack
/// that was instead of allocating a fresh one.
const BOOT_STACK_SIZE: usize = 64 * 1024;

/// Kernel entry point called by the Limine bootloader.
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    assert!(BASE_REVISION.is_supported());

    klog::init();
    kprintln!("minimalos: boot");

    let profile = boot::build_memory_profile();
    // SAFETY: called exactly once, before any `PhysAddr::to_virt()` call.
    unsafe { address::init_hhdm(profile.vaddr_start.as_u64()) };

    pmm::init(&profile);
    kprintln!(
        "minimalos: pmm initialised — {} frames free",
        pmm::blocks_free()
    );

    let pml4 = page_table::active_pml4();
    let mut kernel_vmm = VirtualMemoryManager::new(
        VirtAddr::new(KERNEL_VMM_BASE),
        VirtAddr::new(KERNEL_VMM_BASE + KERNEL_VMM_SIZE),
        X86PageTableMapper::new(),
        pml4,
    );
    let idle_vmm = VirtualMemoryManager::new(
        VirtAddr::new(IDLE_VMM_BASE),
        VirtAddr::new(IDLE_VMM_BASE + IDLE_VMM_SIZE),
        X86PageTableMapper::new(),
        pml4,
    );

    let heap_attrs = MapAttributes { kernel: true, writable: true, cachable: true };
    let heap_blocks = (KERNEL_HEAP_SIZE as u64).div_ceil(pmm::BLOCK_SIZE) as usize;

    let rsp = cpu::read_rsp();
    let boot_stack_base = rsp.saturating_sub(BOOT_STACK_SIZE as u64) as *mut u8;

    pmm::with_pmm(|pmm| {
        let heap_start = kernel_vmm
            .alloc(heap_blocks, None, heap_attrs, pmm)
            .expect("minimalos: failed to reserve kernel heap region");
        // SAFETY: `heap_start` was just reserved above, exclusively for
        // the heap, for the kernel's remaining lifetime.
        unsafe { heap::init(heap_start.as_mut_ptr::<u8>(), KERNEL_HEAP_SIZE) };
        kprintln!("minimalos: heap initialised — {} KiB", KERNEL_HEAP_SIZE / 1024);

        let mut allocator = heap::GlobalHeap;

        // SAFETY: `boot_stack_base`/`BOOT_STACK_SIZE` describe the stack
        // Limine handed us, which is what we're currently running on;
        // `init` is called exactly once, before any other scheduler or
        // `kprint!` call that might check `can_switch`.
        unsafe {
            scheduler::init::<X86PageTableMapper, _>(
                &mut allocator,
                pmm,
                boot_stack_base,
                BOOT_STACK_SIZE,
                kernel_vmm,
                idle_vmm,
            )
        }
        .expect("minimalos: scheduler init failed");
    });

    kprintln!("minimalos: scheduler initialised, idle task ready");
    logger::with_switching_disabled(|| {});

    cpu::halt_forever()
}
