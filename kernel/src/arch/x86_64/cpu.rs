// =============================================================================
// MinimalOS NextGen — CPU Utilities (x86_64)
// =============================================================================
//
// Low-level CPU operations that don't fit in a specific subsystem.
// These are thin wrappers around privileged x86_64 instructions.
//
// DESIGN: These functions are the "bottom" of the abstraction stack.
// They're called by higher-level kernel code (scheduler, memory manager)
// and should have minimal logic — just execute the instruction and return.
//
// N3710 SPECIFIC NOTES:
//   - Airmont microarchitecture (14nm Silvermont derivative)
//   - Supports: SSE4.2, AES-NI, PCLMULQDQ, VT-x
//   - Does NOT support: AVX, AVX2, TSX, SGX
//   - Has: 4 cores, no hyper-threading
//   - Max physical address bits: 34 (16GB addressable)
//   - Supports C-states C1 through C6 for power saving
//
// =============================================================================

/// Halts the CPU in an unrecoverable state.
///
/// Disables interrupts and then halts. The CPU will never wake up.
/// Used for fatal errors (double fault, panic) where we can't continue.
///
/// This function never returns.
#[inline(always)]
pub fn halt_forever() -> ! {
    loop {
        // SAFETY: CLI + HLT in a loop ensures the CPU stays stopped.
        // No interrupt can wake us because interrupts are disabled.
        unsafe {
            core::arch::asm!(
                "cli",
                "hlt",
                options(nomem, nostack)
            );
        }
    }
}

/// Reads the current stack pointer (RSP).
///
/// Used exactly once, at boot: Limine hands control to `_start` on a
/// stack it set up itself (guaranteed at least 64 KiB, per the boot
/// protocol), which the kernel then adopts as the boot task's kernel
/// stack rather than allocating a fresh one.
#[inline(always)]
pub fn read_rsp() -> u64 {
    let value: u64;
    unsafe {
        core::arch::asm!(
            "mov {}, rsp",
            out(reg) value,
            options(nomem, nostack, preserves_flags)
        );
    }
    value
}

/// Reads the current value of the CR3 register.
///
/// CR3 contains the physical address of the current PML4 (top-level page
/// table). Switching CR3 switches the entire virtual address space.
///
/// # Returns
/// The physical address of the current PML4 page table root.
///
/// # Uses
/// - Saving the current address space before a context switch
/// - Debugging: verify which page tables are active
#[inline]
pub fn read_cr3() -> u64 {
    let value: u64;
    // SAFETY: Reading CR3 is privileged but has no side effects.
    unsafe {
        core::arch::asm!(
            "mov {}, cr3",
            out(reg) value,
            options(nomem, nostack, preserves_flags)
        );
    }
    value
}

/// Writes a new value to the CR3 register, switching address spaces.
///
/// This is one of the most critical operations in the kernel:
///   1. Loads a new PML4 physical address into CR3
///   2. The CPU flushes the entire TLB (Translation Lookaside Buffer)
///   3. All subsequent memory accesses use the new page tables
///
/// # Safety
/// The new PML4 must:
///   - Be a valid, properly structured 4-level page table
///   - Map the currently executing kernel code (or we crash immediately)
///   - Be at a 4KB-aligned physical address
///
/// TLB flush on N3710 takes ~50-100 cycles. We minimize CR3 writes
/// by skipping the switch when the new CR3 equals the current one
/// (same-process thread switch).
pub unsafe fn write_cr3(value: u64) {
    // SAFETY: Caller guarantees the page tables are valid.
    // This instruction flushes the entire TLB.
    unsafe {
        core::arch::asm!(
            "mov cr3, {}",
            in(reg) value,
            options(nostack, preserves_flags)
        );
    }
}

/// Invalidates a single page in the TLB.
///
/// When we change a single page table entry (e.g., mapping a new page),
/// we don't need to flush the ENTIRE TLB — we just invalidate the entry
/// for that specific virtual address.
///
/// On N3710: INVLPG takes ~10-20 cycles vs ~50-100 cycles for full TLB flush.
/// For single-page changes, this is 5x faster.
///
/// # Parameters
/// - `addr`: The virtual address whose TLB entry should be invalidated.
///
/// # Note
/// On multi-core systems, this only invalidates the TLB on the CURRENT core.
/// Other cores that may have cached this translation need a TLB shootdown IPI.
#[inline]
pub fn invlpg(addr: u64) {
    // SAFETY: Invalidating a TLB entry is always safe. At worst, it causes
    // a harmless extra page table walk on the next access to that address.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) addr,
            options(nostack, preserves_flags)
        );
    }
}

