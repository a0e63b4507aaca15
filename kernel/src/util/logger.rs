// =============================================================================
// MinimalOS NextGen — kprint!/kprintln! macros
// =============================================================================
//
// Thin kernel-side wrapper around the `klog` crate's plain `print!`/
// `println!` macros. The only thing this layer adds is scheduler
// awareness: per spec.md §5, "`can_switch` is the one bit that logging
// ... toggle[s] to block switches during a print, deferring any pending
// tick" — a print that straddled a task switch could end up interleaved
// with another task's print, or (worse) running on a different kernel
// stack halfway through.
//
// `task_switching`/`switching_enabled` are safe to call before
// `task::scheduler::init()` has run (e.g. from the very first boot
// messages, or from a panic before the scheduler exists) — they no-op
// until a scheduler actually exists to gate.
// =============================================================================

use crate::task::scheduler;

/// Runs `f` with task switching disabled for its duration, restoring the
/// previous gate state afterwards. Used to bracket every kernel print so a
/// switch can never land mid-message.
pub fn with_switching_disabled<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = scheduler::switching_enabled();
    scheduler::task_switching(false);
    let result = f();
    if was_enabled {
        scheduler::task_switching(true);
    }
    result
}

/// Prints formatted arguments to the kernel's log sink without a trailing
/// newline, with task switching disabled for the duration.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::util::logger::with_switching_disabled(|| {
            klog::print!($($arg)*);
        })
    };
}

/// Like `kprint!`, but appends a trailing newline.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::util::logger::with_switching_disabled(|| {
            klog::println!($($arg)*);
        })
    };
}
