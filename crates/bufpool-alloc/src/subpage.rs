use std::sync::Arc;

use bufpool_list::{
  HasLink,
  Link,
  SentinelList,
};
use getset::CopyGetters;
use spin::{
  Mutex,
  MutexGuard,
};

use crate::{
  classes::{
    QUANTUM,
    SMALL_MIN,
    SizeClasses,
    TINY_POOL_COUNT,
  },
  storage::ChunkStorage,
};

/// What a slot free did to the subpage as a whole. The caller combines this
/// with list membership to decide whether the page itself goes back to the
/// buddy tree.
#[derive(Clone, Copy, Debug)]
pub struct SlotFreed {
  /// The subpage had no free slots before this call.
  pub was_full: bool,
  /// Every slot is free after this call.
  pub all_free: bool,
}

/// One leaf page sliced into equal elements, tracked by a bitmap. State
/// changes happen under the owning pool's lock; link surgery is left to the
/// caller holding that same lock.
#[derive(CopyGetters)]
pub struct PoolSubpage {
  link: Link<Self>,
  storage: Option<Arc<ChunkStorage>>,
  #[getset(get_copy = "pub")]
  chunk_id: u32,
  #[getset(get_copy = "pub")]
  tree_idx: u32,
  #[getset(get_copy = "pub")]
  run_offset: usize,
  page_size: usize,
  bitmap: Box<[u64]>,
  bitmap_len: usize,
  #[getset(get_copy = "pub")]
  do_not_destroy: bool,
  #[getset(get_copy = "pub")]
  elem_size: usize,
  #[getset(get_copy = "pub")]
  max_num_elems: usize,
  #[getset(get_copy = "pub")]
  num_avail: usize,
  next_avail: i32,
}

impl HasLink for PoolSubpage {
  fn link(&self) -> &Link<Self> {
    &self.link
  }

  fn link_mut(&mut self) -> &mut Link<Self> {
    &mut self.link
  }
}

impl PoolSubpage {
  /// Pool-head sentinel; never allocated from.
  pub fn sentinel() -> Self {
    Self {
      link: Link::default(),
      storage: None,
      chunk_id: 0,
      tree_idx: 0,
      run_offset: 0,
      page_size: 0,
      bitmap: Box::from([]),
      bitmap_len: 0,
      do_not_destroy: false,
      elem_size: 0,
      max_num_elems: 0,
      num_avail: 0,
      next_avail: -1,
    }
  }

  pub fn new(
    storage: Arc<ChunkStorage>,
    chunk_id: u32,
    tree_idx: u32,
    run_offset: usize,
    page_size: usize,
  ) -> Self {
    // Sized once for the smallest element; reinitialization never needs
    // more words than this.
    let words = (page_size / QUANTUM).div_ceil(64).max(1);
    Self {
      link: Link::default(),
      storage: Some(storage),
      chunk_id,
      tree_idx,
      run_offset,
      page_size,
      bitmap: vec![0u64; words].into_boxed_slice(),
      bitmap_len: 0,
      do_not_destroy: false,
      elem_size: 0,
      max_num_elems: 0,
      num_avail: 0,
      next_avail: -1,
    }
  }

  /// Slices the page into `elem_size` elements and resets the bitmap. Also
  /// used when a previously retired subpage is brought back for a new
  /// element size.
  pub fn init(&mut self, elem_size: usize) {
    debug_assert!(elem_size >= QUANTUM && elem_size < self.page_size);

    self.do_not_destroy = true;
    self.elem_size = elem_size;
    self.max_num_elems = self.page_size / elem_size;
    self.num_avail = self.max_num_elems;
    self.next_avail = 0;
    self.bitmap_len = self.max_num_elems.div_ceil(64);
    self.bitmap[..self.bitmap_len].fill(0);
  }

  pub fn backing(&self) -> Option<&Arc<ChunkStorage>> {
    self.storage.as_ref()
  }

  /// Claims one free slot, or `None` when the subpage is exhausted or
  /// retired. The first claim after `init` takes slot 0 without scanning.
  pub fn allocate_slot(&mut self) -> Option<u32> {
    if self.num_avail == 0 || !self.do_not_destroy {
      return None;
    }

    let idx = self.next_avail_idx()?;
    let word = idx >> 6;
    let bit = idx & 63;
    debug_assert_eq!(self.bitmap[word] >> bit & 1, 0);
    self.bitmap[word] |= 1u64 << bit;
    self.num_avail -= 1;
    Some(idx as u32)
  }

  /// Returns a slot to the bitmap and records it as the next-allocation
  /// hint. Panics when the slot is already free.
  pub fn free_slot(&mut self, bitmap_idx: u32) -> SlotFreed {
    let idx = bitmap_idx as usize;
    assert!(idx < self.max_num_elems, "subpage slot {idx} out of range");

    let word = idx >> 6;
    let bit = idx & 63;
    assert!(
      self.bitmap[word] >> bit & 1 == 1,
      "double free of subpage slot {idx}"
    );

    self.bitmap[word] ^= 1u64 << bit;
    self.next_avail = idx as i32;
    self.num_avail += 1;

    SlotFreed {
      was_full: self.num_avail == 1,
      all_free: self.num_avail == self.max_num_elems,
    }
  }

  /// Marks the subpage as no longer usable for allocation; the caller frees
  /// its page back to the buddy tree.
  pub fn retire(&mut self) {
    self.do_not_destroy = false;
  }

  fn next_avail_idx(&mut self) -> Option<usize> {
    let hint = self.next_avail;
    if hint >= 0 {
      self.next_avail = -1;
      return Some(hint as usize);
    }
    self.find_next_avail()
  }

  fn find_next_avail(&self) -> Option<usize> {
    for (i, &bits) in self.bitmap[..self.bitmap_len].iter().enumerate() {
      let free = !bits;
      if free != 0 {
        let idx = (i << 6) + free.trailing_zeros() as usize;
        // Bits past max_num_elems in the last word are never real slots.
        if idx < self.max_num_elems {
          return Some(idx);
        }
      }
    }
    None
  }
}

/// Arena-level list of subpages with free slots for one element size.
/// Locked independently of the arena, which is what lets tiny and small
/// allocations bypass the arena lock entirely.
pub struct SubpagePool {
  list: Mutex<SentinelList<PoolSubpage>>,
}

// SAFETY: the mutex serializes all link access, and member subpages are
// pinned inside their chunk's boxes for as long as they are linked.
unsafe impl Send for SubpagePool {}
unsafe impl Sync for SubpagePool {}

impl SubpagePool {
  fn new() -> Self {
    Self {
      list: Mutex::new(SentinelList::new(Box::new(PoolSubpage::sentinel()))),
    }
  }

  pub fn lock(&self) -> MutexGuard<'_, SentinelList<PoolSubpage>> {
    self.list.lock()
  }

  pub fn len(&self) -> usize {
    self.list.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// All subpage pools of one arena: one per tiny multiple of `QUANTUM`
/// (index 0 unused) and one per small power of two below the page size.
pub struct SubpagePools {
  classes: SizeClasses,
  tiny: Box<[SubpagePool]>,
  small: Box<[SubpagePool]>,
}

impl SubpagePools {
  pub fn new(classes: SizeClasses) -> Self {
    let tiny: Vec<SubpagePool> = (0..TINY_POOL_COUNT).map(|_| SubpagePool::new()).collect();
    let small: Vec<SubpagePool> = (0..classes.small_pool_count())
      .map(|_| SubpagePool::new())
      .collect();

    Self {
      classes,
      tiny: tiny.into_boxed_slice(),
      small: small.into_boxed_slice(),
    }
  }

  /// Pool head for an element size; `elem_size` must be a normalized tiny
  /// or small size.
  pub fn pool_for(&self, elem_size: usize) -> &SubpagePool {
    if self.classes.is_tiny(elem_size) {
      &self.tiny[SizeClasses::tiny_idx(elem_size)]
    } else {
      &self.small[SizeClasses::small_idx(elem_size)]
    }
  }

  pub fn tiny_elem_size(idx: usize) -> usize {
    idx * QUANTUM
  }

  pub fn small_elem_size(idx: usize) -> usize {
    SMALL_MIN << idx
  }

  pub fn tiny_pools(&self) -> &[SubpagePool] {
    &self.tiny
  }

  pub fn small_pools(&self) -> &[SubpagePool] {
    &self.small
  }
}
