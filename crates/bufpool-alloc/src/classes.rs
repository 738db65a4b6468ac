use getset::CopyGetters;

/// Smallest allocation step; every tiny size is a multiple of this.
pub const QUANTUM: usize = 16;
/// First small size. Tiny sizes run from `QUANTUM` below this bound.
pub const SMALL_MIN: usize = 512;
/// One pool per tiny multiple of `QUANTUM`; index 0 stays unused.
pub const TINY_POOL_COUNT: usize = SMALL_MIN / QUANTUM;

pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_ORDER_LIMIT: u32 = 14;
pub const MAX_CHUNK_SIZE: usize = 1 << 30;

const _: () = assert!(QUANTUM.is_power_of_two());
const _: () = assert!(SMALL_MIN.is_power_of_two());
const _: () = assert!(MIN_PAGE_SIZE > SMALL_MIN);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeClass {
  Tiny,
  Small,
  Normal,
  Huge,
}

/// Size-class geometry shared by every chunk of one pool: the page size the
/// buddy tree bottoms out at, the chunk size it tops out at, and the index
/// arithmetic between them. Copied freely; all fields are immutable.
#[derive(Clone, Copy, Debug, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct SizeClasses {
  page_size: usize,
  page_shifts: u32,
  chunk_size: usize,
  max_order: u32,
  subpage_overflow_mask: usize,
}

impl SizeClasses {
  /// Callers validate `page_size` and `max_order` through the pool config
  /// before building geometry from them.
  pub fn new(page_size: usize, max_order: u32) -> Self {
    debug_assert!(page_size.is_power_of_two());
    debug_assert!(page_size >= MIN_PAGE_SIZE);
    debug_assert!(max_order <= MAX_ORDER_LIMIT);

    let page_shifts = page_size.trailing_zeros();
    Self {
      page_size,
      page_shifts,
      chunk_size: page_size << max_order,
      max_order,
      subpage_overflow_mask: !(page_size - 1),
    }
  }

  /// Rounds a requested capacity to the size the pool actually hands out:
  /// tiny requests to the next multiple of `QUANTUM`, small and normal
  /// requests to the next power of two, huge requests unchanged.
  pub fn normalize(&self, requested: usize) -> usize {
    if requested > self.chunk_size {
      return requested;
    }
    if requested >= SMALL_MIN {
      return requested.next_power_of_two();
    }
    if requested == 0 {
      return QUANTUM;
    }
    (requested + QUANTUM - 1) & !(QUANTUM - 1)
  }

  pub fn class_of(&self, norm: usize) -> SizeClass {
    if norm > self.chunk_size {
      SizeClass::Huge
    } else if self.is_subpage_size(norm) {
      if norm < SMALL_MIN {
        SizeClass::Tiny
      } else {
        SizeClass::Small
      }
    } else {
      SizeClass::Normal
    }
  }

  pub fn is_subpage_size(&self, norm: usize) -> bool {
    (norm & self.subpage_overflow_mask) == 0
  }

  pub fn is_tiny(&self, norm: usize) -> bool {
    norm < SMALL_MIN
  }

  pub fn tiny_idx(norm: usize) -> usize {
    norm >> QUANTUM.trailing_zeros()
  }

  pub fn small_idx(norm: usize) -> usize {
    (norm.ilog2() - SMALL_MIN.ilog2()) as usize
  }

  pub fn small_pool_count(&self) -> usize {
    (self.page_shifts - SMALL_MIN.ilog2()) as usize
  }

  /// Cache bucket index for a normal (whole-run) size.
  pub fn normal_idx(&self, norm: usize) -> usize {
    (norm.ilog2() - self.page_shifts) as usize
  }

  /// Tree depth whose runs are exactly `norm` bytes long. `norm` must be a
  /// power of two between the page size and the chunk size.
  pub fn depth_for(&self, norm: usize) -> u32 {
    self.max_order - (norm.ilog2() - self.page_shifts)
  }

  pub fn leaf_count(&self) -> usize {
    1 << self.max_order
  }

  /// Length in bytes of the run rooted at tree index `id`.
  pub fn run_len(&self, id: u32) -> usize {
    self.chunk_size >> id.ilog2()
  }

  /// Byte offset of the run rooted at tree index `id`, derived from the
  /// node's position within its level.
  pub fn run_offset(&self, id: u32) -> usize {
    let depth = id.ilog2();
    let shift = (id ^ (1 << depth)) as usize;
    shift * self.run_len(id)
  }
}
