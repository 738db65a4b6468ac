pub mod allocator;
pub mod arena;
pub mod buf;
pub mod chunk;
pub mod chunk_list;
pub mod classes;
pub mod config;
pub mod handle;
pub mod metrics;
pub mod refcount;
pub mod storage;
pub mod subpage;
pub mod tcache;
