// =============================================================================
// MinimalOS NextGen — VFS Handle Table
// =============================================================================
//
// spec.md §4.6: "a bitmap of `VFS_HANDLES_PER_PROCESS` entries (default
// `max(u16) = 65535`) and a map handle→node. `add_handle` returns a
// "none" signal if full; `get_handle`, `clear_handle`, and `has_handle`
// enforce bounds and "is-set" preconditions. `clear_handle` on a
// not-set handle fails with `VFSHandleNotSet`."
//
// The node type is opaque to this table — it only ever stores the raw
// pointer a caller hands it (spec.md §6, "VFS node ... opaque pointer;
// the task stores only the pointer and the handle number").
// =============================================================================

use alloc::collections::BTreeMap;

use crate::memory::bitmap::Bitmap;

/// Default handle-table capacity: `max(u16)`, per spec.md §4.6.
pub const VFS_HANDLES_PER_PROCESS: usize = u16::MAX as usize;

/// A VFS handle — an index into this task's handle table, not a global
/// identifier.
pub type Handle = usize;

/// Errors produced by handle-table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    /// `clear_handle`/`get_handle` called with a handle that isn't set.
    VFSHandleNotSet,
}

/// A per-task table mapping handle numbers to opaque VFS node pointers.
pub struct HandleTable {
    bitmap: Bitmap<u64>,
    nodes: BTreeMap<Handle, *mut ()>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self { bitmap: Bitmap::new(VFS_HANDLES_PER_PROCESS), nodes: BTreeMap::new() }
    }

    /// Reserves the lowest free handle and associates it with `node`,
    /// or returns `None` if the table is full.
    pub fn add_handle(&mut self, node: *mut ()) -> Option<Handle> {
        let handle = self.bitmap.set_first_free()?;
        self.nodes.insert(handle, node);
        Some(handle)
    }

    /// Whether `handle` currently refers to a live node.
    pub fn has_handle(&self, handle: Handle) -> bool {
        self.bitmap.is_set(handle).unwrap_or(false)
    }

    pub fn get_handle(&self, handle: Handle) -> Result<*mut (), HandleError> {
        if !self.has_handle(handle) {
            return Err(HandleError::VFSHandleNotSet);
        }
        Ok(*self.nodes.get(&handle).expect("bitmap/map out of sync"))
    }

    /// Releases `handle`, returning the node that was stored there.
    pub fn clear_handle(&mut self, handle: Handle) -> Result<*mut (), HandleError> {
        if !self.has_handle(handle) {
            return Err(HandleError::VFSHandleNotSet);
        }
        let _ = self.bitmap.clear(handle);
        Ok(self.nodes.remove(&handle).expect("bitmap/map out of sync"))
    }

    /// The set of currently live handles, for the invariant
    /// "`file_handle_mapping` key set equals the set bits of
    /// `file_handles`" (spec.md §3).
    #[cfg(test)]
    fn live_handles(&self) -> alloc::vec::Vec<Handle> {
        self.nodes.keys().copied().collect()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_round_trips() {
        let mut table = HandleTable::new();
        let node = 0x1000 as *mut ();
        let handle = table.add_handle(node).unwrap();
        assert_eq!(table.get_handle(handle), Ok(node));
        assert!(table.has_handle(handle));
    }

    #[test]
    fn clear_on_not_set_handle_is_an_error() {
        let mut table = HandleTable::new();
        assert_eq!(table.clear_handle(0), Err(HandleError::VFSHandleNotSet));
    }

    #[test]
    fn clear_frees_the_handle_for_reuse() {
        let mut table = HandleTable::new();
        let h = table.add_handle(1 as *mut ()).unwrap();
        table.clear_handle(h).unwrap();
        assert!(!table.has_handle(h));
        let reused = table.add_handle(2 as *mut ()).unwrap();
        assert_eq!(reused, h, "lowest-free allocation should reclaim the cleared handle");
    }

    #[test]
    fn handle_set_matches_bitmap_invariant() {
        let mut table = HandleTable::new();
        let a = table.add_handle(1 as *mut ()).unwrap();
        let b = table.add_handle(2 as *mut ()).unwrap();
        let mut live = table.live_handles();
        live.sort_unstable();
        assert_eq!(live, alloc::vec![a, b]);
    }
}
