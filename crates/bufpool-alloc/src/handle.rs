//! Allocation handles: one `u64` that names a run or a subpage slot.
//!
//! The low 32 bits carry the buddy-tree index of the run. The high 32 bits
//! are zero for a whole-run allocation; for a subpage slot they carry the
//! bitmap index with a marker bit forced on, so that slot 0 of a subpage
//! is still distinguishable from a plain run.

/// Marker bit in the high half of a subpage handle.
pub const SUBPAGE_FLAG: u32 = 0x4000_0000;

pub fn whole_run(tree_idx: u32) -> u64 {
  tree_idx as u64
}

pub fn subpage(tree_idx: u32, bitmap_idx: u32) -> u64 {
  (((bitmap_idx | SUBPAGE_FLAG) as u64) << 32) | tree_idx as u64
}

pub fn tree_idx(handle: u64) -> u32 {
  handle as u32
}

pub fn is_subpage(handle: u64) -> bool {
  (handle >> 32) != 0
}

pub fn bitmap_idx(handle: u64) -> u32 {
  ((handle >> 32) as u32) & !SUBPAGE_FLAG
}
