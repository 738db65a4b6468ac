pub const fn is_aligned(value: usize, align: usize) -> Option<bool> {
  if !align.is_power_of_two() {
    return None;
  }
  Some((value & (align - 1)) == 0)
}

pub const fn align_up(value: usize, align: usize) -> Option<usize> {
  if !align.is_power_of_two() {
    return None;
  }

  let mask = align - 1;
  if let Some(sum) = value.checked_add(mask) {
    return Some(sum & !mask);
  }

  None
}

pub const fn align_down(value: usize, align: usize) -> Option<usize> {
  if !align.is_power_of_two() {
    return None;
  }

  Some(value & !(align - 1))
}

/// Base-two logarithm of an exact power of two, `None` otherwise.
pub const fn log2_exact(value: usize) -> Option<u32> {
  if !value.is_power_of_two() {
    return None;
  }
  Some(value.trailing_zeros())
}
