use std::{
  alloc::{
    Layout,
    alloc_zeroed,
    dealloc,
    handle_alloc_error,
  },
  ptr::NonNull,
  sync::atomic::{
    AtomicU64,
    Ordering,
  },
};

use bufpool_sys::{
  GLOBAL_SYSTEM,
  prim::os_page_align,
  system::SysError,
};
use getset::CopyGetters;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemKind {
  Heap,
  Direct,
}

#[derive(Debug)]
pub enum StorageError {
  ZeroSize,
  Overflow,
  Sys(SysError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Heap chunks start page-aligned so run offsets inside them stay
/// page-aligned too.
const HEAP_ALIGN: usize = 4096;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// One contiguous backing region: a process-heap block or an anonymous
/// mapping. Shared by every buffer carved from it, so the bytes outlive any
/// individual allocation and the region is returned to the system only when
/// the last holder lets go.
///
/// The token is unique per region for the life of the process. Free paths
/// compare it against the registry to catch frees routed at a chunk slot
/// that has since been reused.
#[derive(Debug, CopyGetters)]
pub struct ChunkStorage {
  #[getset(get_copy = "pub")]
  kind: MemKind,
  base: NonNull<u8>,
  #[getset(get_copy = "pub")]
  len: usize,
  mapped_len: usize,
  #[getset(get_copy = "pub")]
  token: u64,
}

// SAFETY: ChunkStorage is a raw byte region plus plain metadata. Which
// thread reads or writes which byte range is coordinated by the pool's
// handles and locks, not by this type.
unsafe impl Send for ChunkStorage {}
unsafe impl Sync for ChunkStorage {}

impl ChunkStorage {
  pub fn new(kind: MemKind, len: usize) -> StorageResult<Self> {
    if len == 0 {
      return Err(StorageError::ZeroSize);
    }

    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    match kind {
      MemKind::Heap => {
        let layout =
          Layout::from_size_align(len, HEAP_ALIGN).map_err(|_| StorageError::Overflow)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = match NonNull::new(ptr) {
          Some(base) => base,
          None => handle_alloc_error(layout),
        };
        Ok(Self {
          kind,
          base,
          len,
          mapped_len: len,
          token,
        })
      }
      MemKind::Direct => {
        let mapped_len = os_page_align(len).map_err(|_| StorageError::Overflow)?;
        let base = unsafe { GLOBAL_SYSTEM.map(mapped_len) }.map_err(StorageError::Sys)?;
        Ok(Self {
          kind,
          base,
          len,
          mapped_len,
          token,
        })
      }
    }
  }

  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  /// Pointer `offset` bytes into the region.
  ///
  /// # Safety
  ///
  /// `offset` must not exceed `len`, and access through the pointer must
  /// stay inside the region and follow the owning allocation's handle.
  pub unsafe fn ptr_at(&self, offset: usize) -> *mut u8 {
    debug_assert!(offset <= self.len);
    unsafe { self.base.as_ptr().add(offset) }
  }
}

impl Drop for ChunkStorage {
  fn drop(&mut self) {
    match self.kind {
      MemKind::Heap => {
        // SAFETY: same size and alignment the region was allocated with.
        let layout = unsafe { Layout::from_size_align_unchecked(self.mapped_len, HEAP_ALIGN) };
        unsafe { dealloc(self.base.as_ptr(), layout) };
      }
      MemKind::Direct => {
        let _ = unsafe { GLOBAL_SYSTEM.unmap(self.base, self.mapped_len) };
      }
    }
  }
}
