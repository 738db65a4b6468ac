use super::*;
use crate::prim::os_page_size;

#[test]
#[cfg(any(unix, windows))]
fn test_map_unmap_roundtrip() {
  let size = os_page_size();

  unsafe {
    let base = GLOBAL_SYSTEM
      .map(size)
      .expect("should map one OS page");

    let slice = core::slice::from_raw_parts_mut(base.as_ptr(), size);
    assert!(slice.iter().all(|&b| b == 0), "fresh mapping should be zeroed");

    slice[0] = 42;
    slice[size - 1] = 24;
    assert_eq!(slice[0], 42, "mapped memory should be writable");
    assert_eq!(slice[size - 1], 24, "end of mapping should be writable");

    let result = GLOBAL_SYSTEM.unmap(base, size);
    assert!(result.is_ok(), "should unmap successfully");
  }
}

#[test]
#[cfg(any(unix, windows))]
fn test_map_large_region() {
  let size = os_page_size() * 64;

  unsafe {
    let base = GLOBAL_SYSTEM
      .map(size)
      .expect("should map a multi-page region");

    let slice = core::slice::from_raw_parts_mut(base.as_ptr(), size);
    slice.fill(0xAB);
    assert_eq!(slice[size / 2], 0xAB);

    GLOBAL_SYSTEM.unmap(base, size).expect("should unmap");
  }
}

#[test]
#[cfg(any(unix, windows))]
fn test_map_rejects_unaligned_size() {
  unsafe {
    let result = GLOBAL_SYSTEM.map(123);
    assert!(
      matches!(result, Err(SysError::InvalidArgument)),
      "non-page-multiple size should be rejected"
    );

    let result = GLOBAL_SYSTEM.map(0);
    assert!(
      matches!(result, Err(SysError::InvalidArgument)),
      "zero size should be rejected"
    );
  }
}

#[test]
#[cfg(not(any(unix, windows)))]
fn test_unsupported_system_map() {
  unsafe {
    let result = GLOBAL_SYSTEM.map(4096);
    assert!(matches!(result, Err(SysError::Unsupported)));
  }
}
