use super::*;
use crate::{
  classes::{
    SizeClass,
    SizeClasses,
  },
  config::PoolConfig,
};

fn arena() -> Arc<Arena> {
  Arc::new(Arena::new(7, MemKind::Heap, SizeClasses::new(4096, 3), 0))
}

fn cache(arena: &Arc<Arena>) -> Arc<ThreadCache> {
  let config = PoolConfig {
    page_size: 4096,
    max_order: 3,
    tiny_cache_size: 8,
    small_cache_size: 8,
    normal_cache_size: 8,
    max_cached_buffer_size: 32 * 1024,
    cache_trim_interval: 0,
    ..PoolConfig::default()
  };
  Arc::new(ThreadCache::new(arena.classes(), &config))
}

fn pooled_buf(
  arena: &Arc<Arena>,
  cache: Option<Arc<ThreadCache>>,
  capacity: usize,
  max_capacity: usize,
) -> PooledBuf {
  let alloc = arena.allocate(arena.classes().normalize(capacity)).unwrap();
  PooledBuf::pooled(Arc::clone(arena), cache, alloc, capacity, max_capacity)
}

#[test]
fn fresh_buffer_state() {
  let arena = arena();
  let buf = pooled_buf(&arena, None, 1000, 4096);

  assert_eq!(buf.ref_cnt(), 1);
  assert_eq!(buf.capacity(), 1000);
  assert_eq!(buf.max_capacity(), 4096);
  assert_eq!(buf.norm, 1024);
  assert_eq!(buf.kind(), MemKind::Heap);
  assert_eq!(buf.reader_index(), 0);
  assert_eq!(buf.writer_index(), 0);
  assert_eq!(buf.readable_bytes(), 0);
  assert_eq!(buf.writable_bytes(), 1000);
}

#[test]
fn retain_release_walks_the_count_down_once() {
  let arena = arena();
  let buf = pooled_buf(&arena, None, 256, 4096);

  buf.retain();
  assert_eq!(buf.ref_cnt(), 2);
  assert!(!buf.release());
  assert_eq!(buf.ref_cnt(), 1);
  assert!(buf.release());
  assert_eq!(buf.ref_cnt(), 0);
}

#[test]
#[should_panic(expected = "used after release")]
fn retain_after_final_release_panics() {
  let arena = arena();
  let buf = pooled_buf(&arena, None, 256, 4096);
  assert!(buf.release());
  buf.retain();
}

#[test]
#[should_panic(expected = "only 1 were live")]
fn releasing_more_than_live_panics() {
  let arena = arena();
  let buf = pooled_buf(&arena, None, 256, 4096);
  buf.release_n(2);
}

#[test]
fn final_release_returns_memory_to_the_arena() {
  let arena = arena();
  let buf = pooled_buf(&arena, None, 4096, 32768);
  assert_eq!(arena.stats().active(SizeClass::Normal), 1);

  assert!(buf.release());
  assert_eq!(arena.stats().active(SizeClass::Normal), 0);

  drop(buf);
  assert_eq!(arena.stats().active(SizeClass::Normal), 0);
}

#[test]
fn final_release_parks_in_the_allocating_threads_cache() {
  let arena = arena();
  let cache = cache(&arena);
  let buf = pooled_buf(&arena, Some(Arc::clone(&cache)), 4096, 32768);

  assert!(buf.release());
  // Cached memory is still charged as active until trimmed or reused.
  assert_eq!(arena.stats().active(SizeClass::Normal), 1);

  // SAFETY: this test thread owns the cache.
  let entry = unsafe { cache.allocate(MemKind::Heap, 4096) }.unwrap();
  entry.free_to_chunk(4096);
  assert_eq!(arena.stats().active(SizeClass::Normal), 0);
}

#[test]
fn dropping_with_live_references_reclaims() {
  let arena = arena();
  let buf = pooled_buf(&arena, None, 4096, 32768);
  buf.retain();
  assert_eq!(arena.stats().active(SizeClass::Normal), 1);

  drop(buf);
  assert_eq!(arena.stats().active(SizeClass::Normal), 0);
}

#[test]
#[should_panic(expected = "accessed after final release")]
fn byte_access_after_release_panics() {
  let arena = arena();
  let buf = pooled_buf(&arena, None, 256, 4096);
  assert!(buf.release());
  let _ = buf.as_slice();
}

#[test]
#[should_panic(expected = "accessed after final release")]
fn resizing_after_release_panics() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 256, 4096);
  assert!(buf.release());
  let _ = buf.set_capacity(1024);
}

#[test]
fn slices_cover_exactly_the_capacity() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 1000, 4096);

  assert_eq!(buf.as_slice().len(), 1000);
  for (i, byte) in buf.as_mut_slice().iter_mut().enumerate() {
    *byte = (i % 251) as u8;
  }
  assert_eq!(buf.as_slice()[0], 0);
  assert_eq!(buf.as_slice()[999], (999 % 251) as u8);
}

#[test]
fn cursors_move_inside_the_capacity() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 64, 4096);

  buf.set_index(4, 8);
  assert_eq!(buf.readable_bytes(), 4);
  assert_eq!(buf.writable_bytes(), 56);

  buf.set_writer_index(32);
  buf.set_reader_index(32);
  assert_eq!(buf.readable_bytes(), 0);

  buf.clear();
  assert_eq!(buf.reader_index(), 0);
  assert_eq!(buf.writer_index(), 0);
}

#[test]
#[should_panic(expected = "passes the writer index")]
fn reader_cannot_pass_the_writer() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 64, 4096);
  buf.set_reader_index(1);
}

#[test]
#[should_panic(expected = "violates reader <= writer <= capacity")]
fn writer_cannot_pass_the_capacity() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 64, 4096);
  buf.set_index(0, 65);
}

#[test]
fn write_and_read_move_the_cursors() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 64, 4096);

  buf.write_bytes(b"hello");
  assert_eq!(buf.writer_index(), 5);
  assert_eq!(buf.readable(), b"hello");

  let mut out = [0u8; 3];
  assert_eq!(buf.read_bytes(&mut out), 3);
  assert_eq!(&out, b"hel");
  assert_eq!(buf.readable(), b"lo");

  let mut rest = [0u8; 8];
  assert_eq!(buf.read_bytes(&mut rest), 2);
  assert_eq!(&rest[..2], b"lo");
  assert_eq!(buf.readable_bytes(), 0);
}

#[test]
fn growth_inside_the_run_is_free() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 1000, 4096);
  assert_eq!(buf.resize_action(1024), ResizeAction::InPlace);

  buf.set_capacity(1024).unwrap();
  assert_eq!(buf.capacity(), 1024);
  assert_eq!(buf.norm, 1024);
  // Still the one original allocation.
  assert_eq!(arena.stats().lifetime(SizeClass::Small), 1);
}

#[test]
fn shrink_in_the_upper_half_keeps_the_run() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 1024, 4096);
  buf.set_writer_index(1000);

  assert_eq!(buf.resize_action(600), ResizeAction::InPlace);
  buf.set_capacity(600).unwrap();
  assert_eq!(buf.capacity(), 600);
  assert_eq!(buf.writer_index(), 600);
  assert_eq!(arena.stats().lifetime(SizeClass::Small), 1);
}

#[test]
fn growth_past_the_run_copies_and_frees_the_old_run() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 4096, 1 << 20);
  buf.retain();
  buf.write_bytes(&[0xAB; 64]);

  assert_eq!(buf.resize_action(16384), ResizeAction::Replace);
  buf.set_capacity(16384).unwrap();

  assert_eq!(buf.capacity(), 16384);
  assert_eq!(buf.ref_cnt(), 2);
  assert_eq!(buf.writer_index(), 64);
  assert_eq!(&buf.as_slice()[..64], &[0xAB; 64]);
  assert_eq!(arena.stats().lifetime(SizeClass::Normal), 2);
  assert_eq!(arena.stats().active(SizeClass::Normal), 1);

  assert!(!buf.release());
  assert!(buf.release());
  assert_eq!(arena.stats().active(SizeClass::Normal), 0);
}

#[test]
fn deep_shrink_collapses_cursors_past_the_new_end() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 4096, 32768);
  buf.set_index(3000, 3500);

  assert_eq!(buf.resize_action(1024), ResizeAction::Replace);
  buf.set_capacity(1024).unwrap();

  assert_eq!(buf.capacity(), 1024);
  assert_eq!(buf.reader_index(), 1024);
  assert_eq!(buf.writer_index(), 1024);
  assert_eq!(arena.stats().active(SizeClass::Normal), 0);
  assert_eq!(arena.stats().active(SizeClass::Small), 1);
}

#[test]
fn shrink_copies_the_readable_window_and_clamps_the_writer() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 4096, 32768);
  let payload: Vec<u8> = (0..2000).map(|i| (i % 251) as u8).collect();
  buf.write_bytes(&payload);
  buf.set_reader_index(100);

  // The reader sits inside the new capacity, the writer past it: the
  // readable bytes up to the new end must move, the rest is cut off.
  assert_eq!(buf.resize_action(1024), ResizeAction::Replace);
  buf.set_capacity(1024).unwrap();

  assert_eq!(buf.capacity(), 1024);
  assert_eq!(buf.reader_index(), 100);
  assert_eq!(buf.writer_index(), 1024);
  assert_eq!(buf.readable(), &payload[100..1024]);
}

#[test]
fn growth_past_the_chunk_moves_to_a_huge_region() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 4096, 1 << 20);
  buf.write_bytes(b"carry me over");

  buf.set_capacity(40000).unwrap();
  assert_eq!(buf.capacity(), 40000);
  assert_eq!(buf.readable(), b"carry me over");
  assert_eq!(arena.stats().huge_bytes(), 40000);
  assert_eq!(arena.stats().active(SizeClass::Normal), 0);

  assert!(buf.release());
  assert_eq!(arena.stats().huge_bytes(), 0);
  assert_eq!(arena.stats().active(SizeClass::Huge), 0);
}

#[test]
#[should_panic(expected = "exceeds the buffer's maximum")]
fn resizing_past_max_capacity_panics() {
  let arena = arena();
  let mut buf = pooled_buf(&arena, None, 256, 512);
  let _ = buf.set_capacity(513);
}

#[test]
fn huge_buffers_carry_their_own_region() {
  let arena = arena();
  let storage = arena.allocate_huge(40000).unwrap();
  let mut buf = PooledBuf::huge(Arc::clone(&arena), storage, 40000, 1 << 20);

  assert_eq!(buf.kind(), MemKind::Heap);
  assert_eq!(buf.capacity(), 40000);
  assert_eq!(buf.resize_action(40000), ResizeAction::Keep);

  buf.write_bytes(&[7; 128]);
  assert_eq!(&buf.as_slice()[..128], &[7; 128]);

  assert!(buf.release());
  assert_eq!(arena.stats().huge_bytes(), 0);
}
