use std::sync::{
  Arc,
  atomic::{
    AtomicUsize,
    Ordering,
  },
};

use getset::CopyGetters;
use spin::Mutex;

use crate::{
  chunk::PoolChunk,
  chunk_list::{
    ALL_TIERS,
    ALLOC_ORDER,
    ChunkLists,
    PrevAction,
    Tier,
  },
  classes::{
    SizeClass,
    SizeClasses,
  },
  handle,
  metrics::{
    AllocStats,
    ArenaSnapshot,
    TierSnapshot,
  },
  storage::{
    ChunkStorage,
    MemKind,
    StorageResult,
  },
  subpage::SubpagePools,
};

/// A placed pooled allocation, ready to back a buffer.
pub struct Allocation {
  pub(crate) storage: Arc<ChunkStorage>,
  pub(crate) chunk_id: u32,
  pub(crate) handle: u64,
  pub(crate) offset: usize,
  pub(crate) norm: usize,
}

struct ArenaShared {
  /// Chunk registry; slot index is the chunk id carried in buffers and
  /// cache entries. Freed slots are recycled through `free_ids`.
  chunks: Vec<Option<Box<PoolChunk>>>,
  free_ids: Vec<u32>,
  lists: ChunkLists,
}

fn chunk_mut(chunks: &mut [Option<Box<PoolChunk>>], id: u32) -> &mut PoolChunk {
  match chunks.get_mut(id as usize).and_then(Option::as_mut) {
    Some(chunk) => chunk,
    None => panic!("no chunk registered at slot {id}"),
  }
}

fn chunk_ref(chunks: &[Option<Box<PoolChunk>>], id: u32) -> &PoolChunk {
  match chunks.get(id as usize).and_then(Option::as_ref) {
    Some(chunk) => chunk,
    None => panic!("no chunk registered at slot {id}"),
  }
}

/// One locking domain of the pool. Subpage pools carry their own per-size
/// locks so the tiny/small fast path never touches the arena lock; every
/// structural change (chunk creation, tree edits, tier migration) is
/// serialized behind `shared`.
#[derive(CopyGetters)]
pub struct Arena {
  #[getset(get_copy = "pub")]
  pool_id: u64,
  #[getset(get_copy = "pub")]
  kind: MemKind,
  #[getset(get_copy = "pub")]
  classes: SizeClasses,
  max_cached_bytes: usize,
  // Declared before `shared`: the pool sentinels detach their members on
  // drop and those members live inside the chunks behind `shared`.
  pools: SubpagePools,
  shared: Mutex<ArenaShared>,
  stats: AllocStats,
  cached_bytes: AtomicUsize,
  bound_threads: AtomicUsize,
}

// SAFETY: the subpage link pointers inside chunks are only dereferenced
// under the owning pool's lock, and chunk boxes never move while any
// subpage of theirs is linked; everything else behind `shared` is guarded
// by the arena lock.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  pub(crate) fn new(
    pool_id: u64,
    kind: MemKind,
    classes: SizeClasses,
    max_cached_bytes: usize,
  ) -> Self {
    Self {
      pool_id,
      kind,
      classes,
      max_cached_bytes,
      pools: SubpagePools::new(classes),
      shared: Mutex::new(ArenaShared {
        chunks: Vec::new(),
        free_ids: Vec::new(),
        lists: ChunkLists::new(classes.chunk_size()),
      }),
      stats: AllocStats::default(),
      cached_bytes: AtomicUsize::new(0),
      bound_threads: AtomicUsize::new(0),
    }
  }

  pub fn stats(&self) -> &AllocStats {
    &self.stats
  }

  pub fn bound_threads(&self) -> usize {
    self.bound_threads.load(Ordering::Relaxed)
  }

  pub(crate) fn bind_thread(&self) {
    self.bound_threads.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn unbind_thread(&self) {
    self.bound_threads.fetch_sub(1, Ordering::Relaxed);
  }

  pub fn cached_bytes(&self) -> usize {
    self.cached_bytes.load(Ordering::Relaxed)
  }

  /// Reserves cache residency for `bytes`. Refusal tells the caller to
  /// free straight to the chunk instead of parking the entry.
  pub(crate) fn try_reserve_cache_bytes(&self, bytes: usize) -> bool {
    if self.max_cached_bytes == 0 {
      return true;
    }
    let mut current = self.cached_bytes.load(Ordering::Relaxed);
    loop {
      let next = match current.checked_add(bytes) {
        Some(next) if next <= self.max_cached_bytes => next,
        _ => return false,
      };
      match self.cached_bytes.compare_exchange_weak(
        current,
        next,
        Ordering::Relaxed,
        Ordering::Relaxed,
      ) {
        Ok(_) => return true,
        Err(actual) => current = actual,
      }
    }
  }

  pub(crate) fn release_cache_bytes(&self, bytes: usize) {
    if self.max_cached_bytes == 0 {
      return;
    }
    self.cached_bytes.fetch_sub(bytes, Ordering::Relaxed);
  }

  /// Pooled allocation of a normalized size up to the chunk size. Tries
  /// the subpage pools, then every tier that could hold the request, and
  /// only then maps a fresh chunk.
  pub fn allocate(&self, norm: usize) -> StorageResult<Allocation> {
    debug_assert!(norm <= self.classes.chunk_size());
    debug_assert_eq!(norm, self.classes.normalize(norm));

    if self.classes.is_subpage_size(norm) {
      if let Some(alloc) = self.allocate_from_pools(norm) {
        self.stats.record_alloc(self.classes.class_of(norm));
        return Ok(alloc);
      }
    }

    let mut shared = self.shared.lock();
    let alloc = match self.allocate_from_lists(&mut shared, norm) {
      Some(alloc) => alloc,
      None => self.allocate_new_chunk(&mut shared, norm)?,
    };
    drop(shared);

    self.stats.record_alloc(self.classes.class_of(norm));
    Ok(alloc)
  }

  /// Tiny/small fast path: claim a slot from a partially-filled subpage
  /// under the pool lock alone.
  fn allocate_from_pools(&self, elem_size: usize) -> Option<Allocation> {
    let pool = self.pools.pool_for(elem_size);
    let mut list = pool.lock();
    let node = list.first()?;
    // SAFETY: the pool lock is held; linked subpages are owned by this
    // arena's chunks and stay put while linked.
    let sp = unsafe { &mut *node.as_ptr() };

    let storage = Arc::clone(sp.backing()?);
    let bitmap_idx = sp.allocate_slot()?;
    if sp.num_avail() == 0 {
      // SAFETY: node is a linked member and the lock is still held.
      unsafe { list.unlink(node) };
    }

    Some(Allocation {
      storage,
      chunk_id: sp.chunk_id(),
      handle: handle::subpage(sp.tree_idx(), bitmap_idx),
      offset: sp.run_offset() + bitmap_idx as usize * elem_size,
      norm: elem_size,
    })
  }

  fn allocate_from_lists(
    &self,
    shared: &mut ArenaShared,
    norm: usize,
  ) -> Option<Allocation> {
    let ArenaShared { chunks, lists, .. } = shared;
    for tier in ALLOC_ORDER {
      if !lists.list(tier).can_allocate(norm) {
        continue;
      }
      let candidates = lists.list(tier).ids().to_vec();
      for id in candidates {
        let chunk = chunk_mut(chunks, id);
        let handle = match chunk.allocate(norm, &self.pools) {
          Some(handle) => handle,
          None => continue,
        };
        let alloc = self.placed(chunk, handle, norm);
        Self::promote(lists, chunk);
        return Some(alloc);
      }
    }
    None
  }

  fn allocate_new_chunk(
    &self,
    shared: &mut ArenaShared,
    norm: usize,
  ) -> StorageResult<Allocation> {
    let storage = Arc::new(ChunkStorage::new(self.kind, self.classes.chunk_size())?);
    let mut chunk = Box::new(PoolChunk::new(storage, self.classes));

    let id = match shared.free_ids.pop() {
      Some(id) => id,
      None => {
        shared.chunks.push(None);
        (shared.chunks.len() - 1) as u32
      }
    };
    chunk.set_id(id);
    chunk.set_tier(Tier::Init);

    // Register before carving: a subpage created below is reachable
    // through its pool the moment the pool lock drops, and a concurrent
    // free through it must find the chunk in the registry.
    shared.chunks[id as usize] = Some(chunk);
    shared.lists.list_mut(Tier::Init).push(id);

    let ArenaShared { chunks, lists, .. } = shared;
    let chunk = chunk_mut(chunks, id);
    let handle = match chunk.allocate(norm, &self.pools) {
      Some(handle) => handle,
      None => unreachable!("a fresh chunk always fits a normalized request"),
    };
    let alloc = self.placed(chunk, handle, norm);
    Self::promote(lists, chunk);
    Ok(alloc)
  }

  fn placed(&self, chunk: &PoolChunk, handle: u64, norm: usize) -> Allocation {
    let tree_idx = handle::tree_idx(handle);
    let offset = if handle::is_subpage(handle) {
      self.classes.run_offset(tree_idx)
        + handle::bitmap_idx(handle) as usize * norm
    } else {
      self.classes.run_offset(tree_idx)
    };
    Allocation {
      storage: Arc::clone(chunk.storage()),
      chunk_id: chunk.id(),
      handle,
      offset,
      norm,
    }
  }

  fn promote(lists: &mut ChunkLists, chunk: &mut PoolChunk) {
    while (chunk.usage() as i32) >= chunk.tier().max_usage() {
      let Some(next) = chunk.tier().next() else {
        break;
      };
      lists.list_mut(chunk.tier()).remove(chunk.id());
      lists.list_mut(next).push(chunk.id());
      chunk.set_tier(next);
    }
  }

  /// Sinks a chunk toward lower tiers after a free. Returns true when the
  /// chunk fell out of the bottom tier and must be destroyed.
  fn demote(lists: &mut ChunkLists, chunk: &mut PoolChunk) -> bool {
    while (chunk.usage() as i32) < chunk.tier().min_usage() {
      match chunk.tier().prev() {
        PrevAction::Keep => break,
        PrevAction::Destroy => {
          lists.list_mut(chunk.tier()).remove(chunk.id());
          return true;
        }
        PrevAction::Move(prev) => {
          lists.list_mut(chunk.tier()).remove(chunk.id());
          lists.list_mut(prev).push(chunk.id());
          chunk.set_tier(prev);
        }
      }
    }
    false
  }

  /// Returns a pooled allocation to its chunk and migrates the chunk down
  /// the tier chain if its usage fell below the tier floor. The storage
  /// token guards against a stale buffer hitting a recycled registry slot.
  pub fn free(&self, chunk_id: u32, storage_token: u64, handle: u64, norm: usize) {
    let class = self.classes.class_of(norm);
    let mut retired = None;
    {
      let mut shared = self.shared.lock();
      let ArenaShared {
        chunks,
        lists,
        free_ids,
      } = &mut *shared;

      let chunk = chunk_mut(chunks, chunk_id);
      assert_eq!(
        chunk.storage().token(),
        storage_token,
        "stale free into recycled chunk slot {chunk_id}"
      );
      chunk.free(handle, &self.pools);

      if Self::demote(lists, chunk) {
        retired = chunks[chunk_id as usize].take();
        free_ids.push(chunk_id);
      }
    }
    // Unmapping a retired chunk happens outside the arena lock.
    drop(retired);
    self.stats.record_free(class);
  }

  /// Huge allocations bypass the pool: one dedicated mapping, destroyed
  /// when the last reference to its storage drops.
  pub fn allocate_huge(&self, len: usize) -> StorageResult<Arc<ChunkStorage>> {
    let storage = Arc::new(ChunkStorage::new(self.kind, len)?);
    self.stats.record_alloc(SizeClass::Huge);
    self.stats.add_huge_bytes(len);
    Ok(storage)
  }

  pub(crate) fn note_huge_free(&self, len: usize) {
    self.stats.sub_huge_bytes(len);
    self.stats.record_free(SizeClass::Huge);
  }

  pub fn chunk_count(&self) -> usize {
    self.shared.lock().lists.total_chunks()
  }

  pub fn snapshot(&self) -> ArenaSnapshot {
    let shared = self.shared.lock();
    let tiers = ALL_TIERS
      .iter()
      .map(|&tier| TierSnapshot {
        tier,
        usages: shared
          .lists
          .list(tier)
          .ids()
          .iter()
          .map(|&id| chunk_ref(&shared.chunks, id).usage())
          .collect(),
      })
      .collect();
    let chunk_count = shared.lists.total_chunks();
    drop(shared);

    ArenaSnapshot {
      kind: self.kind,
      bound_threads: self.bound_threads(),
      chunk_count,
      used_bytes: chunk_count * self.classes.chunk_size() + self.stats.huge_bytes(),
      cached_bytes: self.cached_bytes(),
      active: self.stats.active_counts(),
      lifetime: self.stats.lifetime_counts(),
      tiers,
    }
  }
}
