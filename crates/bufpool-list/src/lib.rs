#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use core::{
  marker::PhantomData,
  ptr::NonNull,
};

use getset::{
  CopyGetters,
  Getters,
};

pub trait HasLink {
  fn link(&self) -> &Link<Self>
  where
    Self: Sized;
  fn link_mut(&mut self) -> &mut Link<Self>
  where
    Self: Sized;
}

#[derive(Debug, Getters)]
pub struct Link<T>
where
  T: HasLink,
{
  #[getset(get = "pub")]
  next: Option<NonNull<T>>,
  #[getset(get = "pub")]
  prev: Option<NonNull<T>>,
}

impl<T> Default for Link<T>
where
  T: HasLink,
{
  fn default() -> Self {
    Self {
      next: None,
      prev: None,
    }
  }
}

impl<T> Link<T>
where
  T: HasLink,
{
  pub fn is_linked(&self) -> bool {
    self.next.is_some()
  }

  /// True when this node's neighbors coincide, which for a linked member of
  /// a sentinel list means it is the only member.
  pub fn is_sole_member(&self) -> bool {
    self.is_linked() && self.next == self.prev
  }
}

/// Circular intrusive list anchored on an owned sentinel node. Member nodes
/// are owned elsewhere; the list only stores pointers into them.
///
/// All linking operations require that member nodes outlive their
/// membership. Callers serialize access externally; the list itself is not
/// synchronized.
#[derive(Getters, CopyGetters)]
pub struct SentinelList<T>
where
  T: HasLink,
{
  #[getset(get_copy = "pub")]
  head: NonNull<T>,
  #[getset(get_copy = "pub")]
  len: usize,
}

impl<T> SentinelList<T>
where
  T: HasLink,
{
  pub fn new(sentinel: Box<T>) -> Self {
    let mut head = NonNull::from(Box::leak(sentinel));
    let link = unsafe { head.as_mut() }.link_mut();
    link.next = Some(head);
    link.prev = Some(head);
    Self { head, len: 0 }
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn first(&self) -> Option<NonNull<T>> {
    let next = *unsafe { self.head.as_ref() }.link().next();
    next.filter(|&ptr| ptr != self.head)
  }

  /// Links `node` in directly after the sentinel.
  ///
  /// # Safety
  ///
  /// `node` must point to a live value that is not currently linked in any
  /// list, and must stay live while linked.
  pub unsafe fn push_front(&mut self, mut node: NonNull<T>) {
    let mut head = self.head;
    // The sentinel is always self-linked, so its next is never None.
    let mut old_next = (*unsafe { head.as_ref() }.link().next()).unwrap_or(head);

    let node_link = unsafe { node.as_mut() }.link_mut();
    node_link.prev = Some(head);
    node_link.next = Some(old_next);

    unsafe { head.as_mut() }.link_mut().next = Some(node);
    unsafe { old_next.as_mut() }.link_mut().prev = Some(node);

    self.len += 1;
  }

  /// Unlinks `node` and clears its link fields.
  ///
  /// # Safety
  ///
  /// `node` must be a live member of this list.
  pub unsafe fn unlink(&mut self, mut node: NonNull<T>) {
    let link = unsafe { node.as_mut() }.link_mut();
    let prev = link.prev.take();
    let next = link.next.take();

    if let (Some(mut prev), Some(mut next)) = (prev, next) {
      unsafe { prev.as_mut() }.link_mut().next = Some(next);
      unsafe { next.as_mut() }.link_mut().prev = Some(prev);
    }

    self.len -= 1;
  }

  /// Walks the members front to back.
  ///
  /// # Safety
  ///
  /// Every linked node must stay live and unmodified for the iterator's
  /// lifetime; the caller holds whatever lock guards membership.
  pub unsafe fn iter(&self) -> ListIter<'_, T> {
    ListIter {
      head: self.head,
      next: *unsafe { self.head.as_ref() }.link().next(),
      marker: PhantomData,
    }
  }
}

impl<T> Drop for SentinelList<T>
where
  T: HasLink,
{
  fn drop(&mut self) {
    // Detach any members still linked so their links do not dangle into
    // the freed sentinel.
    while let Some(node) = self.first() {
      unsafe { self.unlink(node) };
    }
    drop(unsafe { Box::from_raw(self.head.as_ptr()) });
  }
}

pub struct ListIter<'list, T>
where
  T: HasLink + 'list,
{
  head: NonNull<T>,
  next: Option<NonNull<T>>,
  marker: PhantomData<&'list T>,
}

impl<'list, T> Iterator for ListIter<'list, T>
where
  T: HasLink + 'list,
{
  type Item = &'list T;

  fn next(&mut self) -> Option<Self::Item> {
    let current = self.next?;
    if current == self.head {
      return None;
    }
    let current_ref = unsafe { current.as_ref() };
    self.next = *current_ref.link().next();
    Some(current_ref)
  }
}

#[cfg(test)]
mod tests;
