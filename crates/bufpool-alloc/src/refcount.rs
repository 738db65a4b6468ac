use core::{
  fmt,
  sync::atomic::{
    AtomicU32,
    Ordering,
  },
};

#[derive(Debug, PartialEq, Eq)]
pub enum RefCountError {
  Released,
  Overflow,
  Underflow { live: u32, released: u32 },
}

impl fmt::Display for RefCountError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RefCountError::Released => write!(f, "reference count used after release"),
      RefCountError::Overflow => write!(f, "reference count overflow"),
      RefCountError::Underflow { live, released } => {
        write!(f, "released {released} references but only {live} were live")
      }
    }
  }
}

pub type RefCountResult<T> = Result<T, RefCountError>;

/// Live references shifted left by one: an even raw value `2n` means `n`
/// live references, and the odd value written by the final release poisons
/// the counter so every later retain or release fails instead of racing a
/// resurrection against the deallocation.
pub struct RefCount {
  raw: AtomicU32,
}

// Retains past this raw value are rejected rather than risking a wrap into
// the odd (released) encoding.
const RAW_LIMIT: u32 = 1 << 30;

impl RefCount {
  pub fn new() -> Self {
    Self {
      raw: AtomicU32::new(2),
    }
  }

  pub fn count(&self) -> u32 {
    let raw = self.raw.load(Ordering::Acquire);
    if raw & 1 == 1 { 0 } else { raw >> 1 }
  }

  pub fn try_retain(&self, n: u32) -> RefCountResult<()> {
    if n == 0 || n > RAW_LIMIT >> 1 {
      return Err(RefCountError::Overflow);
    }

    let adjust = n << 1;
    let old = self.raw.fetch_add(adjust, Ordering::Relaxed);
    if old & 1 == 1 {
      self.raw.fetch_sub(adjust, Ordering::Relaxed);
      return Err(RefCountError::Released);
    }
    if old > RAW_LIMIT {
      self.raw.fetch_sub(adjust, Ordering::Relaxed);
      return Err(RefCountError::Overflow);
    }
    Ok(())
  }

  /// Drops `n` references. `Ok(true)` means this call released the final
  /// reference and the owner must deallocate; the counter is poisoned at
  /// that same instant.
  pub fn try_release(&self, n: u32) -> RefCountResult<bool> {
    if n == 0 {
      return Err(RefCountError::Underflow { live: self.count(), released: 0 });
    }

    let mut raw = self.raw.load(Ordering::Acquire);
    loop {
      if raw & 1 == 1 {
        return Err(RefCountError::Released);
      }

      let live = raw >> 1;
      if n > live {
        return Err(RefCountError::Underflow { live, released: n });
      }

      let target = if n == live { 1 } else { raw - (n << 1) };
      match self.raw.compare_exchange_weak(
        raw,
        target,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return Ok(n == live),
        Err(current) => {
          raw = current;
          core::hint::spin_loop();
        }
      }
    }
  }
}

impl Default for RefCount {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for RefCount {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RefCount").field("count", &self.count()).finish()
  }
}
