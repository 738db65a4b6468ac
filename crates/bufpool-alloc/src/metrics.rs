use std::sync::atomic::{
  AtomicU64,
  AtomicUsize,
  Ordering,
};

use crate::{
  chunk_list::Tier,
  classes::SizeClass,
  storage::MemKind,
};

/// Lifetime allocation counters for one arena, split by size class. Updated
/// with relaxed atomics on the allocation and free paths; readers get a
/// monitoring-grade view, never control-flow input. Cache hits are not
/// counted: an entry parked in a thread cache is still an active
/// allocation.
#[derive(Default)]
pub struct AllocStats {
  tiny_allocs: AtomicU64,
  small_allocs: AtomicU64,
  normal_allocs: AtomicU64,
  huge_allocs: AtomicU64,
  tiny_frees: AtomicU64,
  small_frees: AtomicU64,
  normal_frees: AtomicU64,
  huge_frees: AtomicU64,
  huge_bytes: AtomicUsize,
}

impl AllocStats {
  fn allocs(&self, class: SizeClass) -> &AtomicU64 {
    match class {
      SizeClass::Tiny => &self.tiny_allocs,
      SizeClass::Small => &self.small_allocs,
      SizeClass::Normal => &self.normal_allocs,
      SizeClass::Huge => &self.huge_allocs,
    }
  }

  fn frees(&self, class: SizeClass) -> &AtomicU64 {
    match class {
      SizeClass::Tiny => &self.tiny_frees,
      SizeClass::Small => &self.small_frees,
      SizeClass::Normal => &self.normal_frees,
      SizeClass::Huge => &self.huge_frees,
    }
  }

  pub(crate) fn record_alloc(&self, class: SizeClass) {
    self.allocs(class).fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_free(&self, class: SizeClass) {
    self.frees(class).fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn add_huge_bytes(&self, bytes: usize) {
    self.huge_bytes.fetch_add(bytes, Ordering::Relaxed);
  }

  pub(crate) fn sub_huge_bytes(&self, bytes: usize) {
    self.huge_bytes.fetch_sub(bytes, Ordering::Relaxed);
  }

  pub fn lifetime(&self, class: SizeClass) -> u64 {
    self.allocs(class).load(Ordering::Relaxed)
  }

  pub fn freed(&self, class: SizeClass) -> u64 {
    self.frees(class).load(Ordering::Relaxed)
  }

  /// Allocations not yet freed. Clamped, since unsynchronized counter pairs
  /// can be read mid-update.
  pub fn active(&self, class: SizeClass) -> u64 {
    self.lifetime(class).saturating_sub(self.freed(class))
  }

  pub fn huge_bytes(&self) -> usize {
    self.huge_bytes.load(Ordering::Relaxed)
  }

  pub fn lifetime_counts(&self) -> ClassCounts {
    ClassCounts {
      tiny: self.lifetime(SizeClass::Tiny),
      small: self.lifetime(SizeClass::Small),
      normal: self.lifetime(SizeClass::Normal),
      huge: self.lifetime(SizeClass::Huge),
    }
  }

  pub fn active_counts(&self) -> ClassCounts {
    ClassCounts {
      tiny: self.active(SizeClass::Tiny),
      small: self.active(SizeClass::Small),
      normal: self.active(SizeClass::Normal),
      huge: self.active(SizeClass::Huge),
    }
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassCounts {
  pub tiny: u64,
  pub small: u64,
  pub normal: u64,
  pub huge: u64,
}

impl ClassCounts {
  pub fn total(&self) -> u64 {
    self.tiny + self.small + self.normal + self.huge
  }
}

/// Point-in-time view of one chunk tier.
#[derive(Clone, Debug)]
pub struct TierSnapshot {
  pub tier: Tier,
  /// Usage percentage of each resident chunk.
  pub usages: Vec<u32>,
}

impl TierSnapshot {
  pub fn chunks(&self) -> usize {
    self.usages.len()
  }
}

/// Point-in-time view of one arena, taken under its lock.
#[derive(Clone, Debug)]
pub struct ArenaSnapshot {
  pub kind: MemKind,
  pub bound_threads: usize,
  pub chunk_count: usize,
  /// Pooled chunk bytes plus live huge-allocation bytes.
  pub used_bytes: usize,
  /// Bytes currently reserved by thread caches against this arena.
  pub cached_bytes: usize,
  pub active: ClassCounts,
  pub lifetime: ClassCounts,
  pub tiers: Vec<TierSnapshot>,
}

/// Snapshots of every arena in a pool, heap first.
#[derive(Clone, Debug)]
pub struct PoolSnapshot {
  pub heap: Vec<ArenaSnapshot>,
  pub direct: Vec<ArenaSnapshot>,
}

impl PoolSnapshot {
  pub fn arenas(&self) -> impl Iterator<Item = &ArenaSnapshot> {
    self.heap.iter().chain(self.direct.iter())
  }

  pub fn used_bytes(&self) -> usize {
    self.arenas().map(|a| a.used_bytes).sum()
  }

  pub fn active_total(&self) -> u64 {
    self.arenas().map(|a| a.active.total()).sum()
  }
}
