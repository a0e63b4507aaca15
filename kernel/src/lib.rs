// =============================================================================
// MinimalOS NextGen — Kernel Library
// =============================================================================
//
// The four core subsystems (Bitmap, PMM, VMM, Heap, Task, Scheduler) and
// their ambient support code (address types, mapper trait, sync primitives,
// ELF/VFS glue, architecture HAL) live here as an ordinary library crate.
//
// Outside of `cargo test` this is `no_std` — there is no host OS underneath
// us. Under `cargo test` it links against the host's `std`, which is what
// lets every subsystem's unit tests run as plain host binaries instead of
// needing a QEMU round-trip. `extern crate alloc` is needed either way:
// under `no_std` it's the only source of `Vec`/`BTreeMap`/`Box`; under
// `std` it is still the crate these same collections live in.
//
// `main.rs` is the thin `no_std`/`no_main` binary that boots this library
// under Limine; it is never built as part of `cargo test`.
// =============================================================================

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod fs;
pub mod memory;
pub mod sync;
pub mod task;
pub mod util;
