use core::ptr::NonNull;

#[cfg(unix)]
use crate::unix::UNIX_SYSTEM;
#[cfg(windows)]
use crate::windows::WINDOWS_SYSTEM;

#[derive(Debug, PartialEq)]
pub enum SysError {
  Unsupported,
  OutOfMemory,
  InvalidArgument,
}

pub type SysResult<T> = Result<T, SysError>;

/// Low-level view of the platform's anonymous-memory mapper. Chunk storage
/// for direct buffers is carved out of mappings obtained here.
///
/// # Safety
///
/// Implementors must ensure that:
/// - `map` returns memory that is zeroed, OS-page aligned, and readable and
///   writable for the full `size` bytes
/// - `unmap` only operates on a region previously returned by `map` of this
///   system, with the exact size it was mapped with
/// - mapped memory stays valid until `unmap` is called on it
pub unsafe trait System
where
  Self: Send + Sync,
{
  /// Maps `size` bytes of zeroed anonymous memory.
  ///
  /// # Safety
  ///
  /// Caller must ensure `size` is a nonzero multiple of the OS page size.
  unsafe fn map(&self, size: usize) -> SysResult<NonNull<u8>> {
    _ = size;
    Err(SysError::Unsupported)
  }

  /// Returns a mapping to the system.
  ///
  /// # Safety
  ///
  /// Caller must ensure `base` and `size` describe a live mapping returned
  /// by `map` of this system, and that the region is never accessed again.
  unsafe fn unmap(&self, base: NonNull<u8>, size: usize) -> SysResult<()> {
    _ = (base, size);
    Err(SysError::Unsupported)
  }
}

pub struct UnsupportedSystem {}
unsafe impl System for UnsupportedSystem {}

#[cfg(unix)]
pub static GLOBAL_SYSTEM: &dyn System = &UNIX_SYSTEM;

#[cfg(windows)]
pub static GLOBAL_SYSTEM: &dyn System = &WINDOWS_SYSTEM;

#[cfg(not(any(unix, windows)))]
pub static GLOBAL_SYSTEM: &dyn System = &UnsupportedSystem {};

#[cfg(test)]
mod tests;
