use std::sync::{
  Arc,
  atomic::{
    AtomicBool,
    AtomicU32,
    AtomicUsize,
    Ordering,
  },
};

use bufpool_ring::{
  MpscRing,
  RingError,
};

use crate::{
  arena::{
    Allocation,
    Arena,
  },
  classes::{
    QUANTUM,
    SMALL_MIN,
    SizeClasses,
    TINY_POOL_COUNT,
  },
  config::PoolConfig,
  handle,
  storage::{
    ChunkStorage,
    MemKind,
  },
};

/// A freed pooled allocation parked for reuse. Entries are self-contained:
/// they pin their chunk's storage and their arena, so a cache can outlive
/// the pool handle that created it and still return memory correctly.
pub struct CacheEntry {
  pub(crate) storage: Arc<ChunkStorage>,
  pub(crate) arena: Arc<Arena>,
  pub(crate) chunk_id: u32,
  pub(crate) handle: u64,
}

impl CacheEntry {
  /// Slow-path return of a parked entry to its chunk.
  pub(crate) fn free_to_chunk(self, norm: usize) {
    let token = self.storage.token();
    self.arena.free(self.chunk_id, token, self.handle, norm);
  }

  /// Reconstitutes the placement a hit stands for, recomputing the byte
  /// offset from the handle.
  pub(crate) fn into_allocation(self, norm: usize) -> (Arc<Arena>, Allocation) {
    let classes = self.arena.classes();
    let tree_idx = handle::tree_idx(self.handle);
    let offset = if handle::is_subpage(self.handle) {
      classes.run_offset(tree_idx) + handle::bitmap_idx(self.handle) as usize * norm
    } else {
      classes.run_offset(tree_idx)
    };
    let allocation = Allocation {
      storage: self.storage,
      chunk_id: self.chunk_id,
      handle: self.handle,
      offset,
      norm,
    };
    (self.arena, allocation)
  }
}

struct CacheBucket {
  /// Normalized size every entry in this bucket backs.
  norm: usize,
  ring: MpscRing<CacheEntry>,
  /// Pops served since the last trim.
  reuses: AtomicUsize,
}

impl CacheBucket {
  fn new(norm: usize, capacity: usize) -> Self {
    Self {
      norm,
      ring: MpscRing::new(capacity),
      reuses: AtomicUsize::new(0),
    }
  }

  /// Any-thread push. The entry comes back on refusal, either because the
  /// ring is full or the arena's cache-byte budget is spent.
  fn add(&self, entry: CacheEntry) -> Result<(), CacheEntry> {
    if !entry.arena.try_reserve_cache_bytes(self.norm) {
      return Err(entry);
    }
    match self.ring.push(entry) {
      Ok(()) => Ok(()),
      Err(RingError::Full(entry)) => {
        entry.arena.release_cache_bytes(self.norm);
        Err(entry)
      }
    }
  }

  /// # Safety
  ///
  /// Single-consumer side of the ring; only the owning thread may call.
  unsafe fn take(&self) -> Option<CacheEntry> {
    // SAFETY: contract forwarded to the caller.
    let entry = unsafe { self.ring.pop() }?;
    entry.arena.release_cache_bytes(self.norm);
    self.reuses.fetch_add(1, Ordering::Relaxed);
    Some(entry)
  }

  /// Frees queued entries that were cached but not reused since the last
  /// trim.
  ///
  /// # Safety
  ///
  /// Same single-consumer contract as `take`.
  unsafe fn trim(&self) {
    let reused = self.reuses.swap(0, Ordering::Relaxed);
    let mut spare = self.ring.capacity().saturating_sub(reused);
    while spare > 0 {
      // SAFETY: contract forwarded to the caller.
      let Some(entry) = (unsafe { self.ring.pop() }) else {
        return;
      };
      entry.arena.release_cache_bytes(self.norm);
      entry.free_to_chunk(self.norm);
      spare -= 1;
    }
  }

  /// # Safety
  ///
  /// Same single-consumer contract as `take`.
  unsafe fn drain(&self) {
    // SAFETY: contract forwarded to the caller.
    while let Some(entry) = unsafe { self.ring.pop() } {
      entry.arena.release_cache_bytes(self.norm);
      entry.free_to_chunk(self.norm);
    }
  }
}

struct KindCaches {
  tiny: Box<[CacheBucket]>,
  small: Box<[CacheBucket]>,
  normal: Box<[CacheBucket]>,
}

impl KindCaches {
  fn new(classes: &SizeClasses, config: &PoolConfig) -> Self {
    let tiny: Vec<CacheBucket> = if config.tiny_cache_size == 0 {
      Vec::new()
    } else {
      (0..TINY_POOL_COUNT)
        .map(|i| CacheBucket::new(i * QUANTUM, config.tiny_cache_size))
        .collect()
    };

    let small: Vec<CacheBucket> = if config.small_cache_size == 0 {
      Vec::new()
    } else {
      (0..classes.small_pool_count())
        .map(|i| CacheBucket::new(SMALL_MIN << i, config.small_cache_size))
        .collect()
    };

    let largest_normal = config.max_cached_buffer_size.min(classes.chunk_size());
    let normal: Vec<CacheBucket> =
      if config.normal_cache_size == 0 || largest_normal < classes.page_size() {
        Vec::new()
      } else {
        let count = classes.normal_idx(1 << largest_normal.ilog2()) + 1;
        (0..count)
          .map(|i| CacheBucket::new(classes.page_size() << i, config.normal_cache_size))
          .collect()
      };

    Self {
      tiny: tiny.into_boxed_slice(),
      small: small.into_boxed_slice(),
      normal: normal.into_boxed_slice(),
    }
  }

  fn bucket(&self, classes: &SizeClasses, norm: usize) -> Option<&CacheBucket> {
    if classes.is_subpage_size(norm) {
      if classes.is_tiny(norm) {
        self.tiny.get(SizeClasses::tiny_idx(norm))
      } else {
        self.small.get(SizeClasses::small_idx(norm))
      }
    } else {
      self.normal.get(classes.normal_idx(norm))
    }
  }

  fn buckets(&self) -> impl Iterator<Item = &CacheBucket> {
    self
      .tiny
      .iter()
      .chain(self.small.iter())
      .chain(self.normal.iter())
  }
}

/// Front cache bound to one thread. The owning thread pops; any thread may
/// push a freed entry, which is what makes cross-thread release cheap. All
/// single-consumer operations are `unsafe fn`s whose callers prove thread
/// ownership.
pub struct ThreadCache {
  classes: SizeClasses,
  heap: KindCaches,
  direct: KindCaches,
  attempts: AtomicU32,
  trim_interval: u32,
  dead: AtomicBool,
}

impl ThreadCache {
  pub(crate) fn new(classes: SizeClasses, config: &PoolConfig) -> Self {
    Self {
      classes,
      heap: KindCaches::new(&classes, config),
      direct: KindCaches::new(&classes, config),
      attempts: AtomicU32::new(0),
      trim_interval: config.cache_trim_interval,
      dead: AtomicBool::new(false),
    }
  }

  fn kind_caches(&self, kind: MemKind) -> &KindCaches {
    match kind {
      MemKind::Heap => &self.heap,
      MemKind::Direct => &self.direct,
    }
  }

  /// Pops a cached allocation of exactly `norm` bytes, and every
  /// `trim_interval` attempts sweeps stale entries back to their chunks.
  ///
  /// # Safety
  ///
  /// Only the thread that owns this cache may call.
  pub(crate) unsafe fn allocate(&self, kind: MemKind, norm: usize) -> Option<CacheEntry> {
    let bucket = self.kind_caches(kind).bucket(&self.classes, norm)?;
    // SAFETY: contract forwarded to the caller.
    let entry = unsafe { bucket.take() };

    if self.trim_interval > 0 {
      let attempts = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
      if attempts >= self.trim_interval {
        self.attempts.store(0, Ordering::Relaxed);
        // SAFETY: contract forwarded to the caller.
        unsafe { self.trim() };
      }
    }
    entry
  }

  /// Parks a freed allocation. Callable from any thread; a rejected entry
  /// comes back so the caller can free it to its chunk instead.
  pub(crate) fn add(
    &self,
    kind: MemKind,
    norm: usize,
    entry: CacheEntry,
  ) -> Result<(), CacheEntry> {
    if self.dead.load(Ordering::Acquire) {
      return Err(entry);
    }
    match self.kind_caches(kind).bucket(&self.classes, norm) {
      Some(bucket) => bucket.add(entry),
      None => Err(entry),
    }
  }

  /// # Safety
  ///
  /// Only the thread that owns this cache may call.
  pub(crate) unsafe fn trim(&self) {
    for bucket in self.heap.buckets().chain(self.direct.buckets()) {
      // SAFETY: contract forwarded to the caller.
      unsafe { bucket.trim() };
    }
  }

  /// Marks the cache dead and frees everything parked in it. Called when
  /// the owning thread unbinds; late pushes racing this drain are swept up
  /// by `Drop` once the last producer lets go of its reference.
  ///
  /// # Safety
  ///
  /// Only the thread that owns this cache may call.
  pub(crate) unsafe fn retire(&self) {
    self.dead.store(true, Ordering::Release);
    for bucket in self.heap.buckets().chain(self.direct.buckets()) {
      // SAFETY: contract forwarded to the caller.
      unsafe { bucket.drain() };
    }
  }
}

impl Drop for ThreadCache {
  fn drop(&mut self) {
    for bucket in self.heap.buckets().chain(self.direct.buckets()) {
      // SAFETY: exclusive access through &mut self.
      unsafe { bucket.drain() };
    }
  }
}
