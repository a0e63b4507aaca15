// =============================================================================
// MinimalOS NextGen — Task
// =============================================================================
//
// spec.md §4.6. A task owns its stacks, its own virtual memory manager,
// and a VFS handle table; its PID is drawn from (and returned to) the
// process-wide PID bitmap in `task::pid`.
//
// `create` and `create_from_elf` both follow the "acquire in order,
// roll back in reverse on any failure" discipline spec.md §9 asks for:
// `create` gets it for free from RAII (`PidGuard`/`StackGuard` disarm on
// success, free on early-return); `create_from_elf`'s per-section loop
// unwinds manually since its rollback set grows one section at a time.
// =============================================================================

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::fs::elf::{Elf, SectionFlags};
use crate::memory::address::VirtAddr;
use crate::memory::heap::Allocator;
use crate::memory::mapper::{MapAttributes, Mapper};
use crate::memory::pmm::{Pmm, BLOCK_SIZE};
use crate::memory::vmm::{VirtualMemoryManager, VmmError};
use crate::task::context;
use crate::task::handles::HandleTable;
use crate::task::pid::{Pid, PidGuard};
use crate::task::stack::{Stack, StackGuard};

/// Number of virtual blocks reserved for a user task's own stack. Not
/// specified by name in spec.md; 16 KiB is a reasonable default for a
/// teaching kernel with no dynamic stack growth.
const USER_STACK_BLOCKS: usize = 4;

/// Errors produced while creating or loading a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    OutOfMemory,
    AlreadyAllocated,
    OutOfBounds,
}

impl From<VmmError> for TaskError {
    fn from(e: VmmError) -> Self {
        match e {
            VmmError::OutOfMemory => TaskError::OutOfMemory,
            VmmError::AlreadyAllocated => TaskError::AlreadyAllocated,
            VmmError::OutOfBounds => TaskError::OutOfBounds,
            // The remaining variants (`NotAllocated`, the `VMM.set`-only
            // errors, and mapper failures) aren't reachable through the
            // calls `Task` makes into its VMM; surface them as the
            // closest caller-facing kind rather than adding dead arms.
            _ => TaskError::OutOfMemory,
        }
    }
}

/// A user task's own stack: a virtual reservation in the task's VMM,
/// rather than a kernel-heap buffer (it must be present in the task's
/// own page tables, not just the kernel's).
struct UserStack {
    v_start: VirtAddr,
    blocks: usize,
}

impl UserStack {
    fn top(&self) -> u64 {
        self.v_start.as_u64() + (self.blocks as u64) * BLOCK_SIZE
    }
}

/// A schedulable unit of execution: PID, stacks, saved stack pointer,
/// owning VMM, and VFS handle table (spec.md §3).
pub struct Task<M: Mapper> {
    pid: Pid,
    kernel_stack: Stack,
    user_stack: Option<UserStack>,
    stack_pointer: u64,
    kernel: bool,
    entry_point: u64,
    vmm: VirtualMemoryManager<M>,
    handles: HandleTable,
}

impl<M: Mapper> Task<M> {
    /// Creates the boot task (PID 0), adopting the linker-defined boot
    /// stack rather than allocating one. Never rolls back: by
    /// construction this cannot fail (it takes no allocator).
    ///
    /// # Safety
    /// `boot_stack_base`/`boot_stack_size` must describe the kernel's
    /// actual linker-defined boot stack, outliving the kernel.
    pub unsafe fn create_boot(
        boot_stack_base: *mut u8,
        boot_stack_size: usize,
        vmm: VirtualMemoryManager<M>,
    ) -> Self {
        let stack = unsafe {
            Stack::boot(
                core::ptr::NonNull::new(boot_stack_base).expect("boot stack base must not be null"),
                boot_stack_size,
            )
        };
        Self {
            pid: 0,
            stack_pointer: stack.top(),
            kernel_stack: stack,
            user_stack: None,
            kernel: true,
            entry_point: 0,
            vmm,
            handles: HandleTable::new(),
        }
    }

    /// `create(entry_point, kernel, vmm, allocator)` (spec.md §4.6).
    ///
    /// `trampoline` is the address every task's prepared stack `ret`s
    /// into on its first switch-in — always
    /// `context::task_entry_trampoline::<M>` for the real kernel binary.
    pub fn create<A: Allocator>(
        entry_point: u64,
        kernel: bool,
        mut vmm: VirtualMemoryManager<M>,
        allocator: &mut A,
        pmm: &mut Pmm,
        trampoline: u64,
    ) -> Result<Box<Self>, TaskError> {
        let pid_guard = PidGuard::acquire();
        let kstack_guard = StackGuard::acquire(allocator).ok_or(TaskError::OutOfMemory)?;
        let stack_pointer = context::prepare_initial_stack(kstack_guard.top(), trampoline);

        let user_stack = if kernel {
            None
        } else {
            let attrs = MapAttributes { kernel: false, writable: true, cachable: true };
            let v_start = vmm
                .alloc(USER_STACK_BLOCKS, None, attrs, pmm)
                .map_err(TaskError::from)?;
            Some(UserStack { v_start, blocks: USER_STACK_BLOCKS })
        };

        let pid = pid_guard.commit();
        let kernel_stack = kstack_guard.commit();

        Ok(Box::new(Self {
            pid,
            kernel_stack,
            user_stack,
            stack_pointer,
            kernel,
            entry_point,
            vmm,
            handles: HandleTable::new(),
        }))
    }

    /// `create_from_elf(elf, kernel, task_vmm, allocator)` (spec.md §4.6).
    ///
    /// Builds the task as `create` does, with `entry_point =
    /// elf.header.entry_address`, then maps and populates every
    /// `ALLOCATABLE` section. A failure partway through the section loop
    /// rolls back every section mapped so far, then the base task itself
    /// (user stack, kernel stack, PID) — nothing survives a failed
    /// `create_from_elf`.
    pub fn create_from_elf<A: Allocator>(
        elf: &Elf,
        kernel: bool,
        vmm: VirtualMemoryManager<M>,
        allocator: &mut A,
        pmm: &mut Pmm,
        trampoline: u64,
    ) -> Result<Box<Self>, TaskError> {
        let mut task = Self::create(elf.header.entry_address, kernel, vmm, allocator, pmm, trampoline)?;

        let mut allocated: Vec<VirtAddr> = Vec::new();

        for (i, section) in elf.section_headers.iter().enumerate() {
            if !section.is_allocatable() {
                continue;
            }
            let blocks = section.size.div_ceil(BLOCK_SIZE) as usize;
            if blocks == 0 {
                continue;
            }

            let attrs = MapAttributes {
                kernel,
                writable: section.flags.contains(SectionFlags::WRITABLE),
                cachable: true,
            };
            let preferred = VirtAddr::new(section.virtual_address);

            let v_start = match task.vmm.alloc(blocks, Some(preferred), attrs, pmm) {
                Ok(v) => v,
                Err(e) => {
                    Self::unwind_from_elf(task, &allocated, allocator, pmm);
                    return Err(TaskError::from(e));
                }
            };
            allocated.push(v_start);

            if let Some(data) = elf.section_data(i) {
                let mut buf = data.to_vec();
                if let Err(e) = task.vmm.copy_data(&task.vmm, true, &mut buf, v_start) {
                    Self::unwind_from_elf(task, &allocated, allocator, pmm);
                    return Err(TaskError::from(e));
                }
            }
        }

        Ok(task)
    }

    /// Rolls back a partially-loaded ELF task: every section mapped so
    /// far (most recent first), then the user stack, kernel stack, and
    /// PID `create` acquired before the section loop began.
    fn unwind_from_elf<A: Allocator>(
        task: Box<Self>,
        allocated: &[VirtAddr],
        allocator: &mut A,
        pmm: &mut Pmm,
    ) {
        let Task { pid, kernel_stack, user_stack, mut vmm, handles, .. } = *task;
        drop(handles);

        for addr in allocated.iter().rev() {
            let _ = vmm.free(*addr, pmm);
        }
        if let Some(user_stack) = user_stack {
            let _ = vmm.free(user_stack.v_start, pmm);
        }
        if !kernel_stack.is_boot_stack() {
            unsafe { kernel_stack.free(allocator) };
        }
        crate::task::pid::free_pid(pid);
    }

    /// `Destroy` (spec.md §4.6): releases every resource the task owns,
    /// except the boot stack (never freed — it's the linker-defined
    /// range, identified by not being heap-owned).
    pub fn destroy<A: Allocator>(self: Box<Self>, allocator: &mut A, pmm: &mut Pmm) {
        let Task { pid, kernel_stack, user_stack, mut vmm, handles, .. } = *self;
        crate::task::pid::free_pid(pid);
        if !kernel_stack.is_boot_stack() {
            unsafe { kernel_stack.free(allocator) };
        }
        if let Some(user_stack) = user_stack {
            vmm.free(user_stack.v_start, pmm).expect("task: owned user stack was not a live VMM allocation");
        }
        drop(handles);
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    pub fn user_stack_top(&self) -> Option<u64> {
        self.user_stack.as_ref().map(UserStack::top)
    }

    pub fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    pub fn set_stack_pointer(&mut self, value: u64) {
        self.stack_pointer = value;
    }

    pub fn vmm(&self) -> &VirtualMemoryManager<M> {
        &self.vmm
    }

    pub fn vmm_mut(&mut self) -> &mut VirtualMemoryManager<M> {
        &mut self.vmm
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut HandleTable {
        &mut self.handles
    }
}

#[cfg(test)]
impl Task<crate::memory::mapper::test_support::MockMapper> {
    /// Builds a minimal task for scheduler bookkeeping tests, which only
    /// ever read/write `stack_pointer` and never actually switch into
    /// it. Leaks its backing stack buffer — acceptable for a short-lived
    /// test process.
    pub unsafe fn for_test(initial_stack_pointer: u64) -> Self {
        use crate::memory::mapper::test_support::MockMapper;

        let buf: &'static mut [u8; 64] = alloc::boxed::Box::leak(alloc::boxed::Box::new([0u8; 64]));
        let stack = unsafe {
            Stack::boot(core::ptr::NonNull::new(buf.as_mut_ptr()).unwrap(), buf.len())
        };
        Self {
            pid: 0,
            kernel_stack: stack,
            user_stack: None,
            stack_pointer: initial_stack_pointer,
            kernel: true,
            entry_point: 0,
            vmm: VirtualMemoryManager::new(
                VirtAddr::zero(),
                VirtAddr::new(16 * BLOCK_SIZE),
                MockMapper::new(),
                0,
            ),
            handles: HandleTable::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address::PhysAddr;
    use crate::memory::heap::Heap;
    use crate::memory::mapper::test_support::MockMapper;
    use crate::memory::profile::MemoryProfile;

    fn test_pmm(blocks: u64) -> Pmm {
        let profile = MemoryProfile {
            vaddr_start: VirtAddr::zero(),
            vaddr_end: VirtAddr::zero(),
            physaddr_start: PhysAddr::zero(),
            physaddr_end: PhysAddr::new(blocks * BLOCK_SIZE),
            mem_kb: blocks * BLOCK_SIZE / 1024,
            virtual_reserved: alloc::vec![],
            physical_reserved: alloc::vec![],
            modules: alloc::vec![],
        };
        Pmm::new(&profile)
    }

    fn test_heap(size: usize) -> (alloc::vec::Vec<u8>, Heap) {
        let mut backing = alloc::vec![0u8; size + 64];
        let raw = backing.as_mut_ptr();
        let aligned = (raw as usize + 15) & !15;
        let start = unsafe { raw.add(aligned - raw as usize) };
        let heap = unsafe { Heap::init(start, size) };
        (backing, heap)
    }

    fn test_vmm(blocks: u64) -> VirtualMemoryManager<MockMapper> {
        VirtualMemoryManager::new(VirtAddr::zero(), VirtAddr::new(blocks * BLOCK_SIZE), MockMapper::new(), 0)
    }

    #[test]
    fn create_kernel_task_succeeds_and_stack_pointer_is_set() {
        let (_backing, mut heap) = test_heap(1 << 16);
        let mut pmm = test_pmm(64);
        let vmm = test_vmm(64);

        let task = Task::create(0x1000, true, vmm, &mut heap, &mut pmm, 0xDEAD_BEEF).unwrap();
        assert!(task.is_kernel());
        assert_eq!(task.entry_point(), 0x1000);
        assert_ne!(task.stack_pointer(), 0);
    }

    #[test]
    fn create_user_task_reserves_a_user_stack() {
        let (_backing, mut heap) = test_heap(1 << 16);
        let mut pmm = test_pmm(64);
        let vmm = test_vmm(64);

        let task = Task::create(0x2000, false, vmm, &mut heap, &mut pmm, 0xDEAD_BEEF).unwrap();
        assert!(!task.is_kernel());
        assert!(task.user_stack_top().is_some());
    }

    #[test]
    fn destroy_releases_pid_and_stack() {
        let (_backing, mut heap) = test_heap(1 << 16);
        let mut pmm = test_pmm(64);
        let vmm = test_vmm(64);

        let frames_before = pmm.blocks_free();
        let task = Task::create(0x3000, true, vmm, &mut heap, &mut pmm, 0xDEAD_BEEF).unwrap();
        task.destroy(&mut heap, &mut pmm);
        assert_eq!(pmm.blocks_free(), frames_before);
    }

    /// Scenario 6: ELF task construction and clean-up.
    #[test]
    fn elf_task_loads_allocatable_section_scenario() {
        use crate::fs::elf::test_support::{build, RawSection};

        crate::memory::address::test_support::init_test_hhdm();
        let (_backing, mut heap) = test_heap(1 << 16);
        let mut pmm = test_pmm(64);
        let vmm = test_vmm(64);

        let section_vaddr = 4 * BLOCK_SIZE;
        let payload = alloc::vec![0xAAu8; BLOCK_SIZE as usize + 1];
        let flags = (SectionFlags::ALLOCATABLE | SectionFlags::WRITABLE).bits();
        let raw = build(0xDEAD, &[RawSection { flags, vaddr: section_vaddr, data: &payload }]);
        let elf = Elf::parse(&raw).unwrap();

        let frames_before = pmm.blocks_free();
        let task = Task::create_from_elf(&elf, false, vmm, &mut heap, &mut pmm, 0xDEAD_BEEF).unwrap();
        assert_eq!(task.entry_point(), 0xDEAD);

        // ceil((BLOCK_SIZE + 1) / BLOCK_SIZE) == 2 blocks, both Reserved.
        for i in 0..2 {
            let addr = VirtAddr::new(section_vaddr + i * BLOCK_SIZE);
            assert!(task.vmm().is_set(addr).unwrap(), "section block {i} must be reserved");
        }

        let mut readback = alloc::vec![0u8; payload.len()];
        task.vmm().copy_data(task.vmm(), false, &mut readback, VirtAddr::new(section_vaddr)).unwrap();
        assert_eq!(readback, payload, "section bytes must have been copied into the task's VMM");

        task.destroy(&mut heap, &mut pmm);
        assert_eq!(pmm.blocks_free(), frames_before);
    }

    /// Scenario 6: a second section colliding with an already-reserved
    /// page rolls back every section `create_from_elf` allocated so far.
    #[test]
    fn elf_task_rolls_back_earlier_sections_on_collision_scenario() {
        use crate::fs::elf::test_support::{build, RawSection};

        crate::memory::address::test_support::init_test_hhdm();
        let (_backing, mut heap) = test_heap(1 << 16);
        let mut pmm = test_pmm(64);
        let mut vmm = test_vmm(64);

        let first_vaddr = 4 * BLOCK_SIZE;
        let second_vaddr = 10 * BLOCK_SIZE;

        // Pre-reserve the second section's page so create_from_elf's
        // second VMM.alloc collides with it.
        vmm.alloc(1, Some(VirtAddr::new(second_vaddr)), MapAttributes::default(), &mut pmm)
            .expect("pre-reservation must succeed");

        let flags = SectionFlags::ALLOCATABLE.bits();
        let raw = build(
            0xBEEF,
            &[
                RawSection { flags, vaddr: first_vaddr, data: b"first section" },
                RawSection { flags, vaddr: second_vaddr, data: b"second section" },
            ],
        );
        let elf = Elf::parse(&raw).unwrap();

        let frames_before = pmm.blocks_free();
        let result = Task::create_from_elf(&elf, false, vmm, &mut heap, &mut pmm, 0xDEAD_BEEF);
        assert_eq!(result.err(), Some(TaskError::AlreadyAllocated));
        // The pre-reservation's own frame is untouched; everything
        // create_from_elf itself acquired (first section, stacks, PID)
        // must have been rolled back.
        assert_eq!(pmm.blocks_free(), frames_before);
    }
}
