#[cfg(windows)]
use core::ptr::NonNull;

#[cfg(windows)]
use crate::{
  prim::is_os_page_aligned,
  system::{
    SysError,
    SysResult,
    System,
  },
};

pub struct WindowsSystem {}

#[cfg(windows)]
pub static WINDOWS_SYSTEM: WindowsSystem = WindowsSystem {};

#[cfg(windows)]
unsafe impl System for WindowsSystem {
  unsafe fn map(&self, size: usize) -> SysResult<NonNull<u8>> {
    use windows_sys::Win32::System::Memory::{
      MEM_COMMIT,
      MEM_RESERVE,
      PAGE_READWRITE,
      VirtualAlloc,
    };

    if size == 0 || is_os_page_aligned(size) != Ok(true) {
      return Err(SysError::InvalidArgument);
    }

    let ptr = unsafe {
      VirtualAlloc(
        core::ptr::null(),
        size,
        MEM_COMMIT | MEM_RESERVE,
        PAGE_READWRITE,
      )
    };

    NonNull::new(ptr as *mut u8).ok_or(SysError::OutOfMemory)
  }

  unsafe fn unmap(&self, base: NonNull<u8>, size: usize) -> SysResult<()> {
    use windows_sys::Win32::System::Memory::{
      MEM_RELEASE,
      VirtualFree,
    };

    _ = size;
    let result = unsafe { VirtualFree(base.as_ptr() as *mut core::ffi::c_void, 0, MEM_RELEASE) };
    if result != 0 {
      return Ok(());
    }

    Err(SysError::InvalidArgument)
  }
}
