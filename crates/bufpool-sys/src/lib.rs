#![cfg_attr(not(test), no_std)]

pub mod math;
pub mod prim;
pub mod system;
pub mod unix;
pub mod windows;

pub use system::GLOBAL_SYSTEM;

pub mod prelude {
  pub use super::{
    GLOBAL_SYSTEM,
    math::{
      align_down,
      align_up,
      is_aligned,
      log2_exact,
    },
    prim::{
      is_os_page_aligned,
      os_page_align,
      os_page_size,
    },
    system::{
      SysError,
      SysResult,
      System,
    },
  };
}
