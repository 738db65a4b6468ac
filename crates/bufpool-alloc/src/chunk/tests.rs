use std::sync::Arc;

use rand::Rng;

use super::*;
use crate::{
  handle,
  storage::MemKind,
};

// 32 KiB chunk with eight 4 KiB leaves; tree nodes are indices 1..16.
fn classes() -> SizeClasses {
  SizeClasses::new(4096, 3)
}

fn chunk() -> (PoolChunk, SubpagePools) {
  let c = classes();
  let storage = Arc::new(ChunkStorage::new(MemKind::Heap, c.chunk_size()).unwrap());
  (PoolChunk::new(storage, c), SubpagePools::new(c))
}

// Mirrors the pool-first fast path an arena runs before touching the tree.
fn pool_alloc(pools: &SubpagePools, elem: usize) -> Option<u64> {
  let pool = pools.pool_for(elem);
  let mut list = pool.lock();
  let node = list.first()?;
  // SAFETY: the pool lock is held and the subpage box outlives the test.
  let sp = unsafe { &mut *node.as_ptr() };
  let idx = sp.allocate_slot()?;
  if sp.num_avail() == 0 {
    // SAFETY: node is a linked member and the lock is still held.
    unsafe { list.unlink(node) };
  }
  Some(handle::subpage(sp.tree_idx(), idx))
}

#[test]
fn fresh_chunk_is_fully_free() {
  let (c, _) = chunk();
  assert_eq!(c.free_bytes(), 32 * 1024);
  assert_eq!(c.usage(), 0);
  assert_eq!(c.tier(), Tier::Init);
  assert_eq!(c.map[1], 0);
}

#[test]
fn whole_chunk_run_takes_the_root() {
  let (mut c, pools) = chunk();
  let h = c.allocate_run(32 * 1024).unwrap();
  assert_eq!(handle::tree_idx(h), 1);
  assert!(!handle::is_subpage(h));
  assert_eq!(c.free_bytes(), 0);
  assert_eq!(c.usage(), 100);

  assert_eq!(c.allocate_run(4096), None);

  c.free(h, &pools);
  assert_eq!(c.free_bytes(), 32 * 1024);
  assert_eq!(c.map[1], 0);
}

#[test]
fn page_runs_fill_left_to_right() {
  let (mut c, _) = chunk();
  for leaf in 8..16 {
    let h = c.allocate_run(4096).unwrap();
    assert_eq!(handle::tree_idx(h), leaf);
  }
  assert_eq!(c.free_bytes(), 0);
  assert_eq!(c.allocate_run(4096), None);
}

#[test]
fn freed_buddies_merge_into_a_larger_run() {
  let (mut c, pools) = chunk();
  let left = c.allocate_run(4096).unwrap();
  let right = c.allocate_run(4096).unwrap();
  assert_eq!(handle::tree_idx(left), 8);
  assert_eq!(handle::tree_idx(right), 9);

  c.free(left, &pools);
  // One buddy back: the parent can serve a page again but not 8 KiB.
  assert_eq!(c.map[4], 3);

  c.free(right, &pools);
  assert_eq!(c.map[4], 2);

  // The merged pair is the leftmost 8 KiB run, so it is handed out first.
  let merged = c.allocate_run(8192).unwrap();
  assert_eq!(handle::tree_idx(merged), 4);
}

#[test]
fn usage_rounds_toward_the_busy_end() {
  let c = SizeClasses::new(8192, 11);
  let storage = Arc::new(ChunkStorage::new(MemKind::Heap, c.chunk_size()).unwrap());
  let mut chunk = PoolChunk::new(storage, c);

  assert_eq!(chunk.usage(), 0);

  // Halving runs leave exactly one page free: less than 1% but not full.
  let mut size = c.chunk_size() / 2;
  while size >= c.page_size() {
    chunk.allocate_run(size).unwrap();
    size /= 2;
  }
  assert_eq!(chunk.free_bytes(), c.page_size());
  assert_eq!(chunk.usage(), 99);

  chunk.allocate_run(c.page_size()).unwrap();
  assert_eq!(chunk.usage(), 100);
}

#[test]
fn tiny_allocation_slices_a_leaf_into_the_pool() {
  let (mut c, pools) = chunk();
  let before = c.free_bytes();

  let first = c.allocate(64, &pools).unwrap();
  assert!(handle::is_subpage(first));
  assert_eq!(handle::bitmap_idx(first), 0);
  assert_eq!(c.free_bytes(), before - 4096);
  assert_eq!(pools.pool_for(64).len(), 1);

  // Later slots of the same leaf come from the pool, not the chunk; asking
  // the chunk again carves a second leaf.
  let pooled = pool_alloc(&pools, 64).unwrap();
  assert_eq!(handle::tree_idx(pooled), handle::tree_idx(first));
  assert_eq!(handle::bitmap_idx(pooled), 1);
  assert_eq!(c.free_bytes(), before - 4096);

  let fresh = c.allocate(64, &pools).unwrap();
  assert_ne!(handle::tree_idx(fresh), handle::tree_idx(first));
  assert_eq!(c.free_bytes(), before - 2 * 4096);
  assert_eq!(pools.pool_for(64).len(), 2);
}

#[test]
fn subpage_leaf_returns_only_after_its_pool_moves_on() {
  let (mut c, pools) = chunk();
  let full = c.free_bytes();

  // 2048-byte elements give two slots per leaf; two chunk allocations plus
  // two pool hits fill two subpages, both of which leave the pool full.
  let a1 = c.allocate(2048, &pools).unwrap();
  let a2 = pool_alloc(&pools, 2048).unwrap();
  let b1 = c.allocate(2048, &pools).unwrap();
  let b2 = pool_alloc(&pools, 2048).unwrap();
  assert_eq!(handle::tree_idx(a1), handle::tree_idx(a2));
  assert_eq!(handle::tree_idx(b1), handle::tree_idx(b2));
  assert_ne!(handle::tree_idx(a1), handle::tree_idx(b1));
  assert_eq!(c.free_bytes(), full - 2 * 4096);
  assert_eq!(pools.pool_for(2048).len(), 0);

  c.free(a1, &pools);
  assert_eq!(pools.pool_for(2048).len(), 1);
  assert_eq!(c.free_bytes(), full - 2 * 4096);

  // Empty but the pool's only member: the leaf stays claimed.
  c.free(a2, &pools);
  assert_eq!(pools.pool_for(2048).len(), 1);
  assert_eq!(c.free_bytes(), full - 2 * 4096);

  c.free(b1, &pools);
  assert_eq!(pools.pool_for(2048).len(), 2);

  // Empty with a sibling in the pool: retired, leaf back to the tree.
  c.free(b2, &pools);
  assert_eq!(pools.pool_for(2048).len(), 1);
  assert_eq!(c.free_bytes(), full - 4096);

  // The freed leaf is the leftmost one available and its retired subpage
  // is revived in place for a different element size.
  let revived = c.allocate(512, &pools).unwrap();
  assert_eq!(handle::tree_idx(revived), handle::tree_idx(b1));
  assert_eq!(handle::bitmap_idx(revived), 0);
  assert_eq!(pools.pool_for(512).len(), 1);
}

#[test]
fn tree_minimums_hold_after_random_churn() {
  let classes = SizeClasses::new(4096, 5);
  let storage = Arc::new(ChunkStorage::new(MemKind::Heap, classes.chunk_size()).unwrap());
  let mut c = PoolChunk::new(storage, classes);
  let pools = SubpagePools::new(classes);
  let sizes = [512usize, 2048, 4096, 8192, 16 * 1024];
  let mut rng = rand::rng();
  let mut live: Vec<u64> = Vec::new();

  for _ in 0..4000 {
    if live.is_empty() || rng.random_bool(0.55) {
      let norm = sizes[rng.random_range(0..sizes.len())];
      if let Some(h) = c.allocate(norm, &pools) {
        live.push(h);
      }
    } else {
      let h = live.swap_remove(rng.random_range(0..live.len()));
      c.free(h, &pools);
    }

    // Every internal node holds min(children), except that two fully free
    // buddies collapse back to the parent's own depth.
    for node in 1..classes.leaf_count() {
      let left = c.map[2 * node];
      let right = c.map[2 * node + 1];
      let child_depth = c.depths[2 * node];
      let expected = if left == child_depth && right == child_depth {
        c.depths[node]
      } else {
        left.min(right)
      };
      assert_eq!(c.map[node], expected, "node {node} out of step");
    }
  }
}

#[test]
#[should_panic(expected = "double free of run")]
fn double_free_of_a_run_panics() {
  let (mut c, pools) = chunk();
  let h = c.allocate_run(4096).unwrap();
  c.free(h, &pools);
  c.free(h, &pools);
}

#[test]
#[should_panic(expected = "no subpage behind handle")]
fn freeing_a_fabricated_subpage_handle_panics() {
  let (mut c, pools) = chunk();
  c.free(handle::subpage(8, 0), &pools);
}
