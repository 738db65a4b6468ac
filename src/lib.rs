pub use bufpool_alloc::{
  allocator::{
    BufPool,
    DEFAULT_MAX_CAPACITY,
  },
  buf::PooledBuf,
  classes::{
    SizeClass,
    SizeClasses,
  },
  config::{
    ConfigError,
    ConfigResult,
    PoolConfig,
  },
  metrics::{
    ArenaSnapshot,
    ClassCounts,
    PoolSnapshot,
    TierSnapshot,
  },
  storage::{
    MemKind,
    StorageError,
    StorageResult,
  },
};

pub mod prelude {
  pub use bufpool_alloc::{
    allocator::{
      BufPool,
      DEFAULT_MAX_CAPACITY,
    },
    buf::PooledBuf,
    config::PoolConfig,
    storage::MemKind,
  };
}
