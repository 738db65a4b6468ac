use core::sync::atomic::{
  AtomicUsize,
  Ordering,
};

use crate::math::{
  align_up,
  is_aligned,
};

#[derive(Debug, PartialEq)]
pub enum PrimError {
  InvalidAlignment,
  Overflow,
}

pub type PrimResult<T> = Result<T, PrimError>;

#[cfg(not(unix))]
const COMMON_PAGE_SIZE: usize = 4096;

#[cfg(unix)]
fn os_page_size_helper() -> usize {
  unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(windows)]
fn os_page_size_helper() -> usize {
  use core::mem::MaybeUninit;

  use windows_sys::Win32::System::SystemInformation::GetSystemInfo;

  let mut info = MaybeUninit::uninit();
  unsafe { GetSystemInfo(info.as_mut_ptr()) };
  let size = unsafe { info.assume_init_ref() }.dwPageSize as usize;
  if size.is_power_of_two() { size } else { COMMON_PAGE_SIZE }
}

#[cfg(not(any(unix, windows)))]
fn os_page_size_helper() -> usize {
  COMMON_PAGE_SIZE
}

/// Granule the operating system maps memory in. Not the pool's page size,
/// which is a configuration knob layered on top of chunks.
pub fn os_page_size() -> usize {
  static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

  match OS_PAGE_SIZE.load(Ordering::Relaxed) {
    0 => {
      let size = os_page_size_helper();
      OS_PAGE_SIZE.store(size, Ordering::Relaxed);
      size
    }
    size => size,
  }
}

pub fn os_page_align(value: usize) -> PrimResult<usize> {
  align_up(value, os_page_size()).ok_or(PrimError::Overflow)
}

pub fn is_os_page_aligned(value: usize) -> PrimResult<bool> {
  is_aligned(value, os_page_size()).ok_or(PrimError::InvalidAlignment)
}
