#[cfg(unix)]
use core::ptr::NonNull;

#[cfg(unix)]
use crate::{
  prim::is_os_page_aligned,
  system::{
    SysError,
    SysResult,
    System,
  },
};

pub struct UnixSystem {}

#[cfg(unix)]
pub static UNIX_SYSTEM: UnixSystem = UnixSystem {};

#[cfg(unix)]
impl UnixSystem {
  const fn prot() -> i32 {
    libc::PROT_READ | libc::PROT_WRITE
  }

  const fn flags() -> i32 {
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS
  }
}

#[cfg(unix)]
unsafe impl System for UnixSystem {
  unsafe fn map(&self, size: usize) -> SysResult<NonNull<u8>> {
    if size == 0 || is_os_page_aligned(size) != Ok(true) {
      return Err(SysError::InvalidArgument);
    }

    let ptr = unsafe {
      libc::mmap(
        core::ptr::null_mut(),
        size,
        Self::prot(),
        Self::flags(),
        -1,
        0,
      )
    };

    if ptr == libc::MAP_FAILED {
      return Err(SysError::OutOfMemory);
    }

    NonNull::new(ptr as *mut u8).ok_or(SysError::OutOfMemory)
  }

  unsafe fn unmap(&self, base: NonNull<u8>, size: usize) -> SysResult<()> {
    let result = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, size) };
    if result == 0 {
      return Ok(());
    }

    Err(SysError::InvalidArgument)
  }
}
