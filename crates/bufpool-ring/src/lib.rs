#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{
  boxed::Box,
  vec::Vec,
};
use core::{
  cell::UnsafeCell,
  mem::MaybeUninit,
  sync::atomic::{
    AtomicUsize,
    Ordering,
  },
};

#[derive(Debug, PartialEq, Eq)]
pub enum RingError<T> {
  Full(T),
}

struct Slot<T> {
  seq: AtomicUsize,
  value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded queue with any-thread producers and a single consumer.
///
/// Each slot carries a sequence number that producers and the consumer
/// hand back and forth: a producer claims a position, writes the value,
/// then publishes by bumping the slot sequence; the consumer reads only
/// published slots and re-arms them one lap ahead. A full queue rejects
/// the push and returns the value to the caller instead of blocking.
pub struct MpscRing<T> {
  mask: usize,
  slots: Box<[Slot<T>]>,
  head: AtomicUsize,
  tail: AtomicUsize,
}

// SAFETY: values are handed across threads through slot publication, so T
// itself must be Send. Consuming through &self is what Sync permits here;
// the single-consumer contract on `pop` covers the rest.
unsafe impl<T: Send> Send for MpscRing<T> {}
unsafe impl<T: Send> Sync for MpscRing<T> {}

impl<T> MpscRing<T> {
  /// Capacity is rounded up to the next power of two, with a floor of two.
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(2).next_power_of_two();
    let mut slots = Vec::with_capacity(capacity);
    for seq in 0..capacity {
      slots.push(Slot {
        seq: AtomicUsize::new(seq),
        value: UnsafeCell::new(MaybeUninit::uninit()),
      });
    }

    Self {
      mask: capacity - 1,
      slots: slots.into_boxed_slice(),
      head: AtomicUsize::new(0),
      tail: AtomicUsize::new(0),
    }
  }

  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  /// Approximate occupancy; exact only when producers and the consumer are
  /// quiescent.
  pub fn len(&self) -> usize {
    let head = self.head.load(Ordering::Relaxed);
    let tail = self.tail.load(Ordering::Relaxed);
    head.wrapping_sub(tail).min(self.capacity())
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn push(&self, value: T) -> Result<(), RingError<T>> {
    let mut pos = self.head.load(Ordering::Relaxed);
    loop {
      let slot = &self.slots[pos & self.mask];
      let seq = slot.seq.load(Ordering::Acquire);
      let diff = (seq as isize).wrapping_sub(pos as isize);

      if diff == 0 {
        match self.head.compare_exchange_weak(
          pos,
          pos.wrapping_add(1),
          Ordering::Relaxed,
          Ordering::Relaxed,
        ) {
          Ok(_) => {
            unsafe { (*slot.value.get()).write(value) };
            slot.seq.store(pos.wrapping_add(1), Ordering::Release);
            return Ok(());
          }
          Err(current) => pos = current,
        }
      } else if diff < 0 {
        return Err(RingError::Full(value));
      } else {
        pos = self.head.load(Ordering::Relaxed);
      }
    }
  }

  /// Takes the oldest published value.
  ///
  /// # Safety
  ///
  /// At most one thread may call `pop` at a time; producers may push
  /// concurrently.
  pub unsafe fn pop(&self) -> Option<T> {
    let pos = self.tail.load(Ordering::Relaxed);
    let slot = &self.slots[pos & self.mask];
    let seq = slot.seq.load(Ordering::Acquire);
    let diff = (seq as isize).wrapping_sub(pos.wrapping_add(1) as isize);

    if diff < 0 {
      return None;
    }

    self.tail.store(pos.wrapping_add(1), Ordering::Relaxed);
    let value = unsafe { (*slot.value.get()).assume_init_read() };
    slot
      .seq
      .store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
    Some(value)
  }
}

impl<T> Drop for MpscRing<T> {
  fn drop(&mut self) {
    // SAFETY: &mut self makes this thread the only accessor.
    while let Some(value) = unsafe { self.pop() } {
      drop(value);
    }
  }
}
