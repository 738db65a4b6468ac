use std::{
  ptr::NonNull,
  sync::Arc,
};

use bufpool_list::HasLink;
use getset::CopyGetters;

use crate::{
  chunk_list::Tier,
  classes::SizeClasses,
  handle,
  storage::ChunkStorage,
  subpage::{
    PoolSubpage,
    SubpagePools,
  },
};

/// One chunk and its buddy tree. The tree is a flat array indexed from 1;
/// each entry holds the shallowest depth still allocatable in that subtree,
/// or the unusable marker (`max_order + 1`) when the subtree is spoken for.
/// Leaves that were handed to the subpage layer keep their `PoolSubpage`
/// boxed here so a retired subpage can be revived in place.
///
/// All tree mutation happens under the owning arena's lock. Subpage slot
/// state is additionally guarded by the element size's pool lock, which is
/// always taken after the arena lock, never before.
#[derive(CopyGetters)]
pub struct PoolChunk {
  storage: Arc<ChunkStorage>,
  classes: SizeClasses,
  #[getset(get_copy = "pub")]
  id: u32,
  #[getset(get_copy = "pub")]
  tier: Tier,
  map: Box<[u8]>,
  depths: Box<[u8]>,
  unusable: u8,
  subpages: Box<[Option<Box<PoolSubpage>>]>,
  #[getset(get_copy = "pub")]
  free_bytes: usize,
}

impl PoolChunk {
  pub fn new(storage: Arc<ChunkStorage>, classes: SizeClasses) -> Self {
    debug_assert_eq!(storage.len(), classes.chunk_size());

    let node_count = 2 << classes.max_order();
    let mut map = vec![0u8; node_count].into_boxed_slice();
    let mut depths = vec![0u8; node_count].into_boxed_slice();
    for depth in 0..=classes.max_order() {
      for id in (1usize << depth)..(2usize << depth) {
        map[id] = depth as u8;
        depths[id] = depth as u8;
      }
    }

    let subpages: Vec<Option<Box<PoolSubpage>>> =
      (0..classes.leaf_count()).map(|_| None).collect();

    Self {
      storage,
      classes,
      id: 0,
      tier: Tier::Init,
      map,
      depths,
      unusable: (classes.max_order() + 1) as u8,
      subpages: subpages.into_boxed_slice(),
      free_bytes: classes.chunk_size(),
    }
  }

  pub(crate) fn set_id(&mut self, id: u32) {
    self.id = id;
  }

  pub(crate) fn set_tier(&mut self, tier: Tier) {
    self.tier = tier;
  }

  pub fn storage(&self) -> &Arc<ChunkStorage> {
    &self.storage
  }

  /// Percentage of the chunk in use, rounded so that a chunk with anything
  /// allocated never reports 0 and only a byte-exact full chunk reports 100.
  pub fn usage(&self) -> u32 {
    if self.free_bytes == 0 {
      return 100;
    }
    let free_pct = (self.free_bytes * 100 / self.classes.chunk_size()) as u32;
    if free_pct == 0 {
      return 99;
    }
    100 - free_pct
  }

  pub fn allocate(&mut self, norm: usize, pools: &SubpagePools) -> Option<u64> {
    if self.classes.is_subpage_size(norm) {
      self.allocate_subpage(norm, pools)
    } else {
      self.allocate_run(norm)
    }
  }

  pub fn allocate_run(&mut self, norm: usize) -> Option<u64> {
    let id = self.allocate_node(self.classes.depth_for(norm))?;
    Some(handle::whole_run(id))
  }

  /// Takes a whole leaf, slices it for `elem_size`, and claims the first
  /// slot. The new subpage is linked into its pool so later allocations of
  /// the same size find it without touching the tree.
  fn allocate_subpage(&mut self, elem_size: usize, pools: &SubpagePools) -> Option<u64> {
    let pool = pools.pool_for(elem_size);
    let mut list = pool.lock();

    let leaf_id = self.allocate_node(self.classes.max_order())?;
    let sp_idx = self.subpage_index(leaf_id);
    let run_offset = self.classes.run_offset(leaf_id);
    let storage = Arc::clone(&self.storage);
    let chunk_id = self.id;
    let page_size = self.classes.page_size();

    let sp = self.subpages[sp_idx].get_or_insert_with(|| {
      Box::new(PoolSubpage::new(
        storage, chunk_id, leaf_id, run_offset, page_size,
      ))
    });
    sp.init(elem_size);
    let node = NonNull::from(&mut **sp);

    match sp.allocate_slot() {
      Some(bitmap_idx) => {
        if sp.num_avail() > 0 {
          // SAFETY: node points into this chunk's subpage box and is not a
          // member of any list; the pool lock is held.
          unsafe { list.push_front(node) };
        }
        Some(handle::subpage(leaf_id, bitmap_idx))
      }
      None => {
        self.free_run(leaf_id);
        None
      }
    }
  }

  /// Returns an allocation to the chunk. A subpage slot free may keep the
  /// page alive; only when the subpage empties out, leaves its pool, and is
  /// not the pool's last member does the leaf go back to the tree.
  pub fn free(&mut self, handle: u64, pools: &SubpagePools) {
    let tree_idx = handle::tree_idx(handle);

    if handle::is_subpage(handle) {
      let sp_idx = self.subpage_index(tree_idx);
      let sp = match self.subpages[sp_idx].as_deref_mut() {
        Some(sp) => sp,
        None => panic!("no subpage behind handle {handle:#x}"),
      };
      let elem_size = sp.elem_size();
      let node = NonNull::from(sp);

      let pool = pools.pool_for(elem_size);
      let mut list = pool.lock();
      // SAFETY: the subpage box is owned by this chunk and the pool lock is
      // held; slot state and links are only touched under that lock.
      let sp = unsafe { &mut *node.as_ptr() };
      let freed = sp.free_slot(handle::bitmap_idx(handle));

      if freed.was_full {
        // SAFETY: a full subpage is never linked; it rejoins its pool here.
        unsafe { list.push_front(node) };
        return;
      }
      if !freed.all_free {
        return;
      }
      if sp.link().is_sole_member() {
        // Keep the last subpage of the pool hot even when empty.
        return;
      }

      sp.retire();
      // SAFETY: the subpage is linked and the pool lock is held.
      unsafe { list.unlink(node) };
      drop(list);
    }

    self.free_run(tree_idx);
  }

  fn allocate_node(&mut self, depth: u32) -> Option<u32> {
    let target = depth as u8;
    let initial = usize::MAX << depth;

    let mut id = 1usize;
    let mut val = self.map[id];
    if val > target {
      return None;
    }

    while val < target || (id & initial) == 0 {
      id <<= 1;
      val = self.map[id];
      if val > target {
        id ^= 1;
        val = self.map[id];
      }
    }

    debug_assert_eq!(self.depths[id], target);
    self.map[id] = self.unusable;
    self.free_bytes -= self.classes.run_len(id as u32);
    self.update_parents_alloc(id);
    Some(id as u32)
  }

  fn free_run(&mut self, id: u32) {
    let idx = id as usize;
    assert!(
      idx >= 1 && idx < self.map.len(),
      "tree index {id} out of range"
    );
    assert!(
      self.map[idx] == self.unusable,
      "double free of run at tree index {id}"
    );

    self.map[idx] = self.depths[idx];
    self.free_bytes += self.classes.run_len(id);
    self.update_parents_free(idx);
  }

  fn update_parents_alloc(&mut self, mut id: usize) {
    while id > 1 {
      let parent = id >> 1;
      self.map[parent] = self.map[id].min(self.map[id ^ 1]);
      id = parent;
    }
  }

  /// Walks up restoring parent values, collapsing two fully free buddies
  /// back into one free run of the shallower depth.
  fn update_parents_free(&mut self, mut id: usize) {
    let mut log_child = self.depths[id] + 1;
    while id > 1 {
      let parent = id >> 1;
      let v1 = self.map[id];
      let v2 = self.map[id ^ 1];
      log_child -= 1;

      if v1 == log_child && v2 == log_child {
        self.map[parent] = log_child - 1;
      } else {
        self.map[parent] = v1.min(v2);
      }
      id = parent;
    }
  }

  fn subpage_index(&self, leaf_id: u32) -> usize {
    leaf_id as usize ^ self.classes.leaf_count()
  }
}

#[cfg(test)]
mod tests;
