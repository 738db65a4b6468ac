use std::{
  cell::RefCell,
  sync::{
    Arc,
    Weak,
    atomic::{
      AtomicU64,
      Ordering,
    },
  },
};

use crate::{
  arena::Arena,
  buf::{
    PooledBuf,
    ResizeAction,
  },
  classes::SizeClasses,
  config::{
    ConfigResult,
    PoolConfig,
  },
  metrics::{
    ArenaSnapshot,
    PoolSnapshot,
  },
  storage::{
    MemKind,
    StorageResult,
  },
  tcache::ThreadCache,
};

/// Capacity ceiling for callers without a real bound.
pub const DEFAULT_MAX_CAPACITY: usize = usize::MAX / 2;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct PoolShared {
  /// Process-unique; buffers carry it (through their arena) so a pool can
  /// refuse buffers that belong to another pool.
  id: u64,
  config: PoolConfig,
  classes: SizeClasses,
  heap: Box<[Arc<Arena>]>,
  direct: Box<[Arc<Arena>]>,
}

impl PoolShared {
  fn arenas(&self, kind: MemKind) -> &[Arc<Arena>] {
    match kind {
      MemKind::Heap => &self.heap,
      MemKind::Direct => &self.direct,
    }
  }
}

/// One thread's attachment to one pool: the arena picked per kind at first
/// use plus the thread's cache. Lives in a thread local; dropping it (pool
/// gone or thread exiting) unbinds the arenas and retires the cache.
struct ThreadBinding {
  pool_id: u64,
  pool: Weak<PoolShared>,
  heap: Option<Arc<Arena>>,
  direct: Option<Arc<Arena>>,
  cache: Arc<ThreadCache>,
}

impl ThreadBinding {
  fn bind(shared: &Arc<PoolShared>) -> Self {
    let heap = least_bound(&shared.heap);
    let direct = least_bound(&shared.direct);
    if let Some(arena) = &heap {
      arena.bind_thread();
    }
    if let Some(arena) = &direct {
      arena.bind_thread();
    }
    Self {
      pool_id: shared.id,
      pool: Arc::downgrade(shared),
      heap,
      direct,
      cache: Arc::new(ThreadCache::new(shared.classes, &shared.config)),
    }
  }

  fn arena(&self, kind: MemKind) -> &Arc<Arena> {
    let slot = match kind {
      MemKind::Heap => &self.heap,
      MemKind::Direct => &self.direct,
    };
    match slot {
      Some(arena) => arena,
      None => panic!("the pool has no arenas of kind {kind:?}"),
    }
  }
}

impl Drop for ThreadBinding {
  fn drop(&mut self) {
    if let Some(arena) = &self.heap {
      arena.unbind_thread();
    }
    if let Some(arena) = &self.direct {
      arena.unbind_thread();
    }
    // SAFETY: bindings live in a thread local, so the dropping thread is
    // the cache's owner.
    unsafe { self.cache.retire() };
  }
}

/// New threads land on the arena with the fewest bound caches.
fn least_bound(arenas: &[Arc<Arena>]) -> Option<Arc<Arena>> {
  arenas
    .iter()
    .min_by_key(|arena| arena.bound_threads())
    .map(Arc::clone)
}

thread_local! {
  /// Bindings of this thread, at most one per live pool.
  static BINDINGS: RefCell<Vec<ThreadBinding>> = const { RefCell::new(Vec::new()) };
}

/// Pooled buffer allocator. A clone is a second handle to the same arenas;
/// buffers stay valid as long as they themselves live, even if every pool
/// handle is dropped first.
#[derive(Clone)]
pub struct BufPool {
  shared: Arc<PoolShared>,
}

impl BufPool {
  pub fn new(config: PoolConfig) -> ConfigResult<Self> {
    config.validate()?;
    let classes = config.classes();
    let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
    let max_cached = config.max_cached_bytes_per_arena;

    let arenas = |kind: MemKind, count: usize| -> Box<[Arc<Arena>]> {
      (0..count)
        .map(|_| Arc::new(Arena::new(id, kind, classes, max_cached)))
        .collect()
    };
    let heap = arenas(MemKind::Heap, config.heap_arenas);
    let direct = arenas(MemKind::Direct, config.direct_arenas);

    Ok(Self {
      shared: Arc::new(PoolShared {
        id,
        config,
        classes,
        heap,
        direct,
      }),
    })
  }

  pub fn with_defaults() -> Self {
    match Self::new(PoolConfig::default()) {
      Ok(pool) => pool,
      Err(err) => unreachable!("default configuration rejected: {err}"),
    }
  }

  pub fn config(&self) -> &PoolConfig {
    &self.shared.config
  }

  pub fn classes(&self) -> SizeClasses {
    self.shared.classes
  }

  /// Buffer of the configured preferred kind.
  pub fn buffer(&self, initial: usize, max_capacity: usize) -> StorageResult<PooledBuf> {
    let kind = self.preferred_kind(self.shared.config.prefer_direct);
    self.build(kind, initial, max_capacity)
  }

  pub fn heap_buffer(&self, initial: usize, max_capacity: usize) -> StorageResult<PooledBuf> {
    self.build(MemKind::Heap, initial, max_capacity)
  }

  pub fn direct_buffer(&self, initial: usize, max_capacity: usize) -> StorageResult<PooledBuf> {
    self.build(MemKind::Direct, initial, max_capacity)
  }

  /// Buffer meant for I/O; prefers direct memory when the pool has it.
  pub fn io_buffer(&self, initial: usize, max_capacity: usize) -> StorageResult<PooledBuf> {
    self.build(self.preferred_kind(true), initial, max_capacity)
  }

  /// A preference settles on the kind that has arenas; the explicit
  /// `heap_buffer`/`direct_buffer` forms skip this and demand their kind.
  fn preferred_kind(&self, prefer_direct: bool) -> MemKind {
    let wanted = if prefer_direct {
      MemKind::Direct
    } else {
      MemKind::Heap
    };
    if self.shared.arenas(wanted).is_empty() {
      match wanted {
        MemKind::Heap => MemKind::Direct,
        MemKind::Direct => MemKind::Heap,
      }
    } else {
      wanted
    }
  }

  fn build(&self, kind: MemKind, initial: usize, max_capacity: usize) -> StorageResult<PooledBuf> {
    assert!(
      initial <= max_capacity,
      "initial capacity {initial} exceeds the maximum {max_capacity}"
    );
    let classes = self.shared.classes;
    self.with_binding(|binding| {
      if initial > classes.chunk_size() {
        let arena = binding.arena(kind);
        let storage = arena.allocate_huge(initial)?;
        return Ok(PooledBuf::huge(
          Arc::clone(arena),
          storage,
          initial,
          max_capacity,
        ));
      }

      let norm = classes.normalize(initial);
      let cache = &binding.cache;
      // SAFETY: the binding is thread-local, so this thread owns the cache.
      if let Some(entry) = unsafe { cache.allocate(kind, norm) } {
        let (arena, alloc) = entry.into_allocation(norm);
        return Ok(PooledBuf::pooled(
          arena,
          Some(Arc::clone(cache)),
          alloc,
          initial,
          max_capacity,
        ));
      }

      let arena = binding.arena(kind);
      let alloc = arena.allocate(norm)?;
      Ok(PooledBuf::pooled(
        Arc::clone(arena),
        Some(Arc::clone(cache)),
        alloc,
        initial,
        max_capacity,
      ))
    })
  }

  /// Resizes `buf` to `new_capacity`. In-place when the new capacity still
  /// fits the reserved run; otherwise new backing is allocated through this
  /// thread's cache path, live bytes are copied over, and the displaced
  /// backing is recycled unless `free_old` is `false`.
  ///
  /// Panics if the buffer belongs to another pool or the capacity exceeds
  /// its maximum.
  pub fn reallocate(
    &self,
    buf: &mut PooledBuf,
    new_capacity: usize,
    free_old: bool,
  ) -> StorageResult<()> {
    buf.ensure_live();
    assert_eq!(
      buf.arena().pool_id(),
      self.shared.id,
      "buffer belongs to a different pool"
    );
    assert!(
      new_capacity <= buf.max_capacity(),
      "capacity {new_capacity} exceeds the buffer's maximum of {}",
      buf.max_capacity()
    );

    match buf.resize_action(new_capacity) {
      ResizeAction::Keep => Ok(()),
      ResizeAction::InPlace => {
        buf.set_capacity_in_place(new_capacity);
        Ok(())
      }
      ResizeAction::Replace => {
        let kind = buf.kind();
        let classes = self.shared.classes;
        let old = self.with_binding(|binding| {
          if new_capacity > classes.chunk_size() {
            let arena = binding.arena(kind);
            let storage = arena.allocate_huge(new_capacity)?;
            return Ok(buf.install_huge(Arc::clone(arena), storage, new_capacity));
          }

          let norm = classes.normalize(new_capacity);
          let cache = &binding.cache;
          // SAFETY: the binding is thread-local, so this thread owns the
          // cache.
          if let Some(entry) = unsafe { cache.allocate(kind, norm) } {
            let (arena, alloc) = entry.into_allocation(norm);
            return Ok(buf.install_pooled(arena, Some(Arc::clone(cache)), alloc, new_capacity));
          }

          let arena = binding.arena(kind);
          let alloc = arena.allocate(norm)?;
          Ok(buf.install_pooled(
            Arc::clone(arena),
            Some(Arc::clone(cache)),
            alloc,
            new_capacity,
          ))
        })?;
        if free_old {
          old.free();
        }
        Ok(())
      }
    }
  }

  /// Point-in-time usage across every arena of the pool.
  pub fn metrics(&self) -> PoolSnapshot {
    PoolSnapshot {
      heap: self.snapshot_arenas(MemKind::Heap),
      direct: self.snapshot_arenas(MemKind::Direct),
    }
  }

  fn snapshot_arenas(&self, kind: MemKind) -> Vec<ArenaSnapshot> {
    self
      .shared
      .arenas(kind)
      .iter()
      .map(|arena| arena.snapshot())
      .collect()
  }

  /// Runs `f` with this thread's binding, creating it on first use. The
  /// binding list is pruned of bindings whose pool has been dropped.
  fn with_binding<R>(&self, f: impl FnOnce(&ThreadBinding) -> R) -> R {
    BINDINGS.with(|cell| {
      let mut bindings = cell.borrow_mut();
      bindings.retain(|binding| binding.pool.strong_count() > 0);

      if let Some(binding) = bindings
        .iter()
        .find(|binding| binding.pool_id == self.shared.id)
      {
        return f(binding);
      }

      let binding = ThreadBinding::bind(&self.shared);
      let result = f(&binding);
      bindings.push(binding);
      result
    })
  }
}
