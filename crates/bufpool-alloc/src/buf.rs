use std::{
  mem,
  ptr,
  slice,
  sync::Arc,
};

use getset::CopyGetters;

use crate::{
  arena::{
    Allocation,
    Arena,
  },
  refcount::RefCount,
  storage::{
    ChunkStorage,
    MemKind,
    StorageResult,
  },
  tcache::{
    CacheEntry,
    ThreadCache,
  },
};

#[derive(Clone, Copy)]
enum Backing {
  /// A run or subpage slot inside a registered chunk.
  Pooled { chunk_id: u32, handle: u64 },
  /// A dedicated region larger than a chunk; never pooled, never cached.
  Huge,
}

/// How a capacity change is carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResizeAction {
  Keep,
  InPlace,
  Replace,
}

/// Returns freed memory the cheap way first: parked in the buffer's cache
/// when one is attached and willing, else straight to the chunk under the
/// arena lock. Huge regions only settle their accounting; the bytes go back
/// to the system when the last `Arc` lets go of the storage.
fn release_backing(
  arena: &Arc<Arena>,
  cache: Option<&Arc<ThreadCache>>,
  storage: &Arc<ChunkStorage>,
  backing: Backing,
  norm: usize,
) {
  match backing {
    Backing::Pooled { chunk_id, handle } => {
      let kind = storage.kind();
      let entry = CacheEntry {
        storage: Arc::clone(storage),
        arena: Arc::clone(arena),
        chunk_id,
        handle,
      };
      let rejected = match cache {
        Some(cache) => match cache.add(kind, norm, entry) {
          Ok(()) => return,
          Err(entry) => entry,
        },
        None => entry,
      };
      rejected.free_to_chunk(norm);
    }
    Backing::Huge => arena.note_huge_free(storage.len()),
  }
}

/// Backing displaced by a reallocation. `free` returns it to the pool;
/// dropping it instead abandons the run, for callers that asked to keep the
/// old bytes alive.
pub(crate) struct OldBacking {
  arena: Arc<Arena>,
  cache: Option<Arc<ThreadCache>>,
  storage: Arc<ChunkStorage>,
  backing: Backing,
  norm: usize,
}

impl OldBacking {
  pub(crate) fn free(self) {
    release_backing(
      &self.arena,
      self.cache.as_ref(),
      &self.storage,
      self.backing,
      self.norm,
    );
  }
}

/// A reference-counted slice of pooled memory with read and write cursors.
///
/// The buffer starts with one reference. `release` drops references and
/// returns `true` exactly once, from the call that drops the last one; that
/// call also hands the memory back. A released buffer keeps its metadata
/// but panics on byte access. Dropping a buffer that still has live
/// references reclaims the memory as if the remaining references were
/// released at once.
///
/// Freed pooled memory is pushed to the cache of the thread that allocated
/// the buffer, so release is cheap from any thread.
#[derive(CopyGetters)]
pub struct PooledBuf {
  refcount: RefCount,
  arena: Arc<Arena>,
  cache: Option<Arc<ThreadCache>>,
  storage: Arc<ChunkStorage>,
  backing: Backing,
  /// Byte offset of this buffer's range inside `storage`.
  offset: usize,
  /// Normalized size actually reserved; capacity may be smaller.
  norm: usize,
  #[getset(get_copy = "pub")]
  capacity: usize,
  #[getset(get_copy = "pub")]
  max_capacity: usize,
  reader: usize,
  writer: usize,
}

impl PooledBuf {
  pub(crate) fn pooled(
    arena: Arc<Arena>,
    cache: Option<Arc<ThreadCache>>,
    alloc: Allocation,
    capacity: usize,
    max_capacity: usize,
  ) -> Self {
    debug_assert!(capacity <= alloc.norm);
    Self {
      refcount: RefCount::new(),
      arena,
      cache,
      storage: alloc.storage,
      backing: Backing::Pooled {
        chunk_id: alloc.chunk_id,
        handle: alloc.handle,
      },
      offset: alloc.offset,
      norm: alloc.norm,
      capacity,
      max_capacity,
      reader: 0,
      writer: 0,
    }
  }

  pub(crate) fn huge(
    arena: Arc<Arena>,
    storage: Arc<ChunkStorage>,
    capacity: usize,
    max_capacity: usize,
  ) -> Self {
    let norm = storage.len();
    Self {
      refcount: RefCount::new(),
      arena,
      cache: None,
      storage,
      backing: Backing::Huge,
      offset: 0,
      norm,
      capacity,
      max_capacity,
      reader: 0,
      writer: 0,
    }
  }

  pub fn kind(&self) -> MemKind {
    self.storage.kind()
  }

  pub(crate) fn arena(&self) -> &Arc<Arena> {
    &self.arena
  }

  pub fn ref_cnt(&self) -> u32 {
    self.refcount.count()
  }

  /// Adds one reference. Panics if the buffer was already released.
  pub fn retain(&self) {
    self.retain_n(1);
  }

  pub fn retain_n(&self, n: u32) {
    if let Err(err) = self.refcount.try_retain(n) {
      panic!("{err}");
    }
  }

  /// Drops one reference, reclaiming the memory and returning `true` when
  /// it was the last. Panics if the buffer was already released.
  pub fn release(&self) -> bool {
    self.release_n(1)
  }

  pub fn release_n(&self, n: u32) -> bool {
    match self.refcount.try_release(n) {
      Ok(true) => {
        release_backing(
          &self.arena,
          self.cache.as_ref(),
          &self.storage,
          self.backing,
          self.norm,
        );
        true
      }
      Ok(false) => false,
      Err(err) => panic!("{err}"),
    }
  }

  pub(crate) fn ensure_live(&self) {
    assert!(
      self.refcount.count() > 0,
      "buffer accessed after final release"
    );
  }

  pub fn as_slice(&self) -> &[u8] {
    self.ensure_live();
    // SAFETY: the handle reserves `norm >= capacity` bytes at `offset`, and
    // the refcount just proved the reservation is still ours.
    unsafe { slice::from_raw_parts(self.storage.ptr_at(self.offset), self.capacity) }
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    self.ensure_live();
    // SAFETY: as in `as_slice`, with exclusive access through `&mut self`.
    unsafe { slice::from_raw_parts_mut(self.storage.ptr_at(self.offset), self.capacity) }
  }

  pub fn reader_index(&self) -> usize {
    self.reader
  }

  pub fn writer_index(&self) -> usize {
    self.writer
  }

  pub fn readable_bytes(&self) -> usize {
    self.writer - self.reader
  }

  pub fn writable_bytes(&self) -> usize {
    self.capacity - self.writer
  }

  /// Sets both cursors. Panics unless `reader <= writer <= capacity`.
  pub fn set_index(&mut self, reader: usize, writer: usize) {
    assert!(
      reader <= writer && writer <= self.capacity,
      "cursor pair ({reader}, {writer}) violates reader <= writer <= capacity {}",
      self.capacity
    );
    self.reader = reader;
    self.writer = writer;
  }

  pub fn set_reader_index(&mut self, reader: usize) {
    assert!(
      reader <= self.writer,
      "reader index {reader} passes the writer index {}",
      self.writer
    );
    self.reader = reader;
  }

  pub fn set_writer_index(&mut self, writer: usize) {
    assert!(
      self.reader <= writer && writer <= self.capacity,
      "writer index {writer} must lie in {}..={}",
      self.reader,
      self.capacity
    );
    self.writer = writer;
  }

  pub fn clear(&mut self) {
    self.reader = 0;
    self.writer = 0;
  }

  /// Bytes written but not yet read.
  pub fn readable(&self) -> &[u8] {
    let (reader, writer) = (self.reader, self.writer);
    &self.as_slice()[reader..writer]
  }

  /// Appends `src` and advances the writer. Panics if it does not fit.
  pub fn write_bytes(&mut self, src: &[u8]) {
    assert!(
      src.len() <= self.writable_bytes(),
      "write of {} bytes into {} writable",
      src.len(),
      self.writable_bytes()
    );
    let writer = self.writer;
    self.as_mut_slice()[writer..writer + src.len()].copy_from_slice(src);
    self.writer += src.len();
  }

  /// Copies up to `dst.len()` readable bytes out, advancing the reader.
  /// Returns how many were copied.
  pub fn read_bytes(&mut self, dst: &mut [u8]) -> usize {
    let n = dst.len().min(self.readable_bytes());
    dst[..n].copy_from_slice(&self.readable()[..n]);
    self.reader += n;
    n
  }

  pub(crate) fn resize_action(&self, new_capacity: usize) -> ResizeAction {
    if new_capacity == self.capacity {
      return ResizeAction::Keep;
    }
    if matches!(self.backing, Backing::Huge) {
      return ResizeAction::Replace;
    }
    if new_capacity > self.capacity {
      if new_capacity <= self.norm {
        ResizeAction::InPlace
      } else {
        ResizeAction::Replace
      }
    } else if new_capacity > self.norm / 2 && (self.norm > 512 || new_capacity > self.norm - 16) {
      // Shrinks that stay in the run's upper half keep the run; releasing
      // it would buy at most half the bytes back.
      ResizeAction::InPlace
    } else {
      ResizeAction::Replace
    }
  }

  /// Adjusts the visible capacity without touching the backing run. Valid
  /// while the new capacity fits the reserved `norm` bytes.
  pub(crate) fn set_capacity_in_place(&mut self, new_capacity: usize) {
    debug_assert!(new_capacity <= self.norm);
    self.capacity = new_capacity;
    self.reader = self.reader.min(new_capacity);
    self.writer = self.writer.min(new_capacity);
  }

  pub(crate) fn install_pooled(
    &mut self,
    arena: Arc<Arena>,
    cache: Option<Arc<ThreadCache>>,
    alloc: Allocation,
    capacity: usize,
  ) -> OldBacking {
    debug_assert!(capacity <= alloc.norm);
    let backing = Backing::Pooled {
      chunk_id: alloc.chunk_id,
      handle: alloc.handle,
    };
    self.swap_backing(
      arena,
      cache,
      alloc.storage,
      backing,
      alloc.offset,
      alloc.norm,
      capacity,
    )
  }

  pub(crate) fn install_huge(
    &mut self,
    arena: Arc<Arena>,
    storage: Arc<ChunkStorage>,
    capacity: usize,
  ) -> OldBacking {
    let norm = storage.len();
    self.swap_backing(arena, None, storage, Backing::Huge, 0, norm, capacity)
  }

  /// Moves the buffer onto new backing, copying the bytes a reader could
  /// still see: everything on growth, the clamped readable window on
  /// shrink. Cursors land clamped inside the new capacity; the refcount is
  /// untouched.
  #[allow(clippy::too_many_arguments)]
  fn swap_backing(
    &mut self,
    arena: Arc<Arena>,
    cache: Option<Arc<ThreadCache>>,
    storage: Arc<ChunkStorage>,
    backing: Backing,
    offset: usize,
    norm: usize,
    new_capacity: usize,
  ) -> OldBacking {
    let mut reader = self.reader;
    let mut writer = self.writer;
    // SAFETY: source and destination stay inside their reservations, and
    // two live handles never cover overlapping bytes even within one chunk.
    unsafe {
      if new_capacity > self.capacity {
        ptr::copy_nonoverlapping(
          self.storage.ptr_at(self.offset),
          storage.ptr_at(offset),
          self.capacity,
        );
      } else if reader < new_capacity {
        if writer > new_capacity {
          writer = new_capacity;
        }
        ptr::copy_nonoverlapping(
          self.storage.ptr_at(self.offset + reader),
          storage.ptr_at(offset + reader),
          writer - reader,
        );
      } else {
        reader = new_capacity;
        writer = new_capacity;
      }
    }

    let old = OldBacking {
      arena: mem::replace(&mut self.arena, arena),
      cache: mem::replace(&mut self.cache, cache),
      storage: mem::replace(&mut self.storage, storage),
      backing: mem::replace(&mut self.backing, backing),
      norm: mem::replace(&mut self.norm, norm),
    };
    self.offset = offset;
    self.capacity = new_capacity;
    self.reader = reader;
    self.writer = writer;
    old
  }

  /// Resizes using the buffer's own arena, freeing any displaced backing.
  /// Panics if `new_capacity` exceeds `max_capacity`.
  ///
  /// Cache misses here go straight to the arena: the buffer's cache belongs
  /// to the allocating thread and may not be the calling one's to pop from.
  pub fn set_capacity(&mut self, new_capacity: usize) -> StorageResult<()> {
    self.ensure_live();
    assert!(
      new_capacity <= self.max_capacity,
      "capacity {new_capacity} exceeds the buffer's maximum of {}",
      self.max_capacity
    );
    match self.resize_action(new_capacity) {
      ResizeAction::Keep => Ok(()),
      ResizeAction::InPlace => {
        self.set_capacity_in_place(new_capacity);
        Ok(())
      }
      ResizeAction::Replace => {
        let arena = Arc::clone(&self.arena);
        let cache = self.cache.clone();
        let classes = arena.classes();
        let old = if new_capacity > classes.chunk_size() {
          let storage = arena.allocate_huge(new_capacity)?;
          self.install_huge(arena, storage, new_capacity)
        } else {
          let alloc = arena.allocate(classes.normalize(new_capacity))?;
          self.install_pooled(arena, cache, alloc, new_capacity)
        };
        old.free();
        Ok(())
      }
    }
  }
}

impl Drop for PooledBuf {
  fn drop(&mut self) {
    // A buffer dropped with live references still owes its memory back.
    if self.refcount.count() > 0 {
      release_backing(
        &self.arena,
        self.cache.as_ref(),
        &self.storage,
        self.backing,
        self.norm,
      );
    }
  }
}

#[cfg(test)]
mod tests;
