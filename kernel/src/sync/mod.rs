// =============================================================================
// MinimalOS NextGen — Kernel Synchronization Primitives
// =============================================================================
//
// This module provides synchronization primitives for the kernel.
// In a kernel, we can't use std::sync (there is no std). We need our own
// primitives that work in a bare-metal, multi-core, interrupt-driven
// environment.
//
// IMPORTANT: Lock ordering rules:
//   Level 1 (innermost): PID bitmap / PMM bitmap
//   Level 2: kernel VMM (virtual bitmap + allocation map)
//   Level 3 (outermost): heap free list
//
// NEVER acquire a lower-level lock while holding a higher-level lock.
// Violating this WILL cause deadlocks once a second core exists.
// =============================================================================

pub mod spinlock;

