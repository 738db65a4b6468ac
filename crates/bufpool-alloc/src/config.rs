use std::{
  fmt,
  num::NonZeroUsize,
  thread::available_parallelism,
};

use crate::classes::{
  MAX_CHUNK_SIZE,
  MAX_ORDER_LIMIT,
  MIN_PAGE_SIZE,
  SizeClasses,
};

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
  PageSizeNotPowerOfTwo(usize),
  PageSizeTooSmall(usize),
  MaxOrderTooLarge(u32),
  ChunkSizeTooLarge { page_size: usize, max_order: u32 },
  NoArenas,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl fmt::Display for ConfigError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ConfigError::PageSizeNotPowerOfTwo(got) => {
        write!(f, "page size {got} is not a power of two")
      }
      ConfigError::PageSizeTooSmall(got) => {
        write!(f, "page size {got} is below the minimum of {MIN_PAGE_SIZE}")
      }
      ConfigError::MaxOrderTooLarge(got) => {
        write!(f, "max order {got} exceeds the limit of {MAX_ORDER_LIMIT}")
      }
      ConfigError::ChunkSizeTooLarge {
        page_size,
        max_order,
      } => {
        write!(
          f,
          "page size {page_size} shifted by order {max_order} exceeds the \
           {MAX_CHUNK_SIZE} byte chunk limit"
        )
      }
      ConfigError::NoArenas => write!(f, "a pool needs at least one arena"),
    }
  }
}

impl std::error::Error for ConfigError {}

/// Construction-time knobs of a pool. All fields are fixed for the pool's
/// lifetime; build a new pool to change them.
#[derive(Clone, Debug)]
pub struct PoolConfig {
  /// Leaf granularity of every chunk's buddy tree. Power of two, at least
  /// `MIN_PAGE_SIZE`.
  pub page_size: usize,
  /// Tree depth; chunk size is `page_size << max_order`.
  pub max_order: u32,
  pub heap_arenas: usize,
  pub direct_arenas: usize,
  /// Kind the plain `buffer` call hands out. `heap_buffer` and
  /// `direct_buffer` ignore it.
  pub prefer_direct: bool,
  /// Per-bucket entry capacity of the tiny, small and normal thread-cache
  /// rings.
  pub tiny_cache_size: usize,
  pub small_cache_size: usize,
  pub normal_cache_size: usize,
  /// Largest normal allocation a thread cache will hold. Zero disables
  /// caching of normal runs entirely.
  pub max_cached_buffer_size: usize,
  /// Cache allocations between automatic trims. Zero disables trimming.
  pub cache_trim_interval: u32,
  /// Upper bound on bytes parked across all thread caches per arena.
  /// Zero means unbounded.
  pub max_cached_bytes_per_arena: usize,
}

fn default_arena_count() -> usize {
  2 * available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

impl Default for PoolConfig {
  fn default() -> Self {
    let arenas = default_arena_count();
    Self {
      page_size: 8192,
      max_order: 11,
      heap_arenas: arenas,
      direct_arenas: arenas,
      prefer_direct: false,
      tiny_cache_size: 512,
      small_cache_size: 256,
      normal_cache_size: 64,
      max_cached_buffer_size: 32 * 1024,
      cache_trim_interval: 8192,
      max_cached_bytes_per_arena: 0,
    }
  }
}

impl PoolConfig {
  pub fn validate(&self) -> ConfigResult<()> {
    if !self.page_size.is_power_of_two() {
      return Err(ConfigError::PageSizeNotPowerOfTwo(self.page_size));
    }
    if self.page_size < MIN_PAGE_SIZE {
      return Err(ConfigError::PageSizeTooSmall(self.page_size));
    }
    if self.max_order > MAX_ORDER_LIMIT {
      return Err(ConfigError::MaxOrderTooLarge(self.max_order));
    }
    // Compared in shifted-down form; the forward shift could discard bits.
    if self.page_size > MAX_CHUNK_SIZE >> self.max_order {
      return Err(ConfigError::ChunkSizeTooLarge {
        page_size: self.page_size,
        max_order: self.max_order,
      });
    }
    if self.heap_arenas == 0 && self.direct_arenas == 0 {
      return Err(ConfigError::NoArenas);
    }
    Ok(())
  }

  /// Geometry for this configuration. Call after `validate`.
  pub fn classes(&self) -> SizeClasses {
    SizeClasses::new(self.page_size, self.max_order)
  }

  pub fn chunk_size(&self) -> usize {
    self.page_size << self.max_order
  }
}
