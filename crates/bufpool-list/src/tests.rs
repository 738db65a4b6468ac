use core::ptr::NonNull;

use super::*;

#[derive(Debug)]
struct TestNode {
  value: i32,
  link: Link<Self>,
}

impl TestNode {
  fn new(value: i32) -> Self {
    Self {
      value,
      link: Link::default(),
    }
  }
}

impl HasLink for TestNode {
  fn link(&self) -> &Link<Self> {
    &self.link
  }

  fn link_mut(&mut self) -> &mut Link<Self> {
    &mut self.link
  }
}

fn node(value: i32) -> Box<TestNode> {
  Box::new(TestNode::new(value))
}

#[test]
fn test_new_list_is_empty() {
  let list = SentinelList::new(node(0));
  assert!(list.is_empty());
  assert_eq!(list.len(), 0);
  assert!(list.first().is_none());
}

#[test]
fn test_push_front_links_after_sentinel() {
  let mut a = node(1);
  let mut b = node(2);
  let mut list = SentinelList::new(node(0));

  unsafe {
    list.push_front(NonNull::from(&mut *a));
    list.push_front(NonNull::from(&mut *b));
  }

  assert_eq!(list.len(), 2);
  let first = list.first().expect("list should have a first node");
  assert_eq!(unsafe { first.as_ref() }.value, 2);

  let values: Vec<i32> = unsafe { list.iter() }.map(|n| n.value).collect();
  assert_eq!(values, vec![2, 1]);
}

#[test]
fn test_unlink_middle_node() {
  let mut a = node(1);
  let mut b = node(2);
  let mut c = node(3);
  let mut list = SentinelList::new(node(0));

  unsafe {
    list.push_front(NonNull::from(&mut *c));
    list.push_front(NonNull::from(&mut *b));
    list.push_front(NonNull::from(&mut *a));
    list.unlink(NonNull::from(&mut *b));
  }

  assert_eq!(list.len(), 2);
  assert!(!b.link().is_linked());

  let values: Vec<i32> = unsafe { list.iter() }.map(|n| n.value).collect();
  assert_eq!(values, vec![1, 3]);
}

#[test]
fn test_unlink_to_empty() {
  let mut a = node(1);
  let mut list = SentinelList::new(node(0));

  unsafe {
    list.push_front(NonNull::from(&mut *a));
    list.unlink(NonNull::from(&mut *a));
  }

  assert!(list.is_empty());
  assert!(list.first().is_none());

  // The sentinel must be self-linked again so pushes keep working.
  unsafe { list.push_front(NonNull::from(&mut *a)) };
  assert_eq!(list.len(), 1);
  assert_eq!(unsafe { list.first().unwrap().as_ref() }.value, 1);
}

#[test]
fn test_sole_member_detection() {
  let mut a = node(1);
  let mut b = node(2);
  let mut list = SentinelList::new(node(0));

  unsafe { list.push_front(NonNull::from(&mut *a)) };
  assert!(a.link().is_sole_member());

  unsafe { list.push_front(NonNull::from(&mut *b)) };
  assert!(!a.link().is_sole_member());
  assert!(!b.link().is_sole_member());

  unsafe { list.unlink(NonNull::from(&mut *b)) };
  assert!(a.link().is_sole_member());
}

#[test]
fn test_drop_detaches_members() {
  let mut a = node(1);
  let mut b = node(2);

  {
    let mut list = SentinelList::new(node(0));
    unsafe {
      list.push_front(NonNull::from(&mut *a));
      list.push_front(NonNull::from(&mut *b));
    }
  }

  assert!(!a.link().is_linked());
  assert!(!b.link().is_linked());
}
