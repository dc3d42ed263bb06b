// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::Ring;
use pretty_assertions::assert_eq;

#[test]
fn new_ring_is_empty() {
  let ring: Ring<i32> = Ring::new(5);
  assert_eq!(0, ring.count());
  assert_eq!(5, ring.capacity());
}

#[test]
#[should_panic(expected = "ring capacity must be at least 1")]
fn zero_capacity_panics() {
  let _ring: Ring<i32> = Ring::new(0);
}

#[test]
fn enqueue_and_latest() {
  let mut ring = Ring::new(3);

  ring.enqueue(10);
  assert_eq!(1, ring.count());
  assert_eq!(&10, ring.latest());

  ring.enqueue(20);
  assert_eq!(2, ring.count());
  assert_eq!(&20, ring.latest());

  ring.enqueue(30);
  assert_eq!(3, ring.count());
  assert_eq!(&30, ring.latest());
}

#[test]
fn count_keeps_increasing_past_capacity() {
  let mut ring = Ring::new(3);
  for v in 0..10 {
    ring.enqueue(v);
  }
  assert_eq!(10, ring.count());
  assert_eq!(&9, ring.latest());
}

#[test]
fn before_reads_positionally() {
  let mut ring = Ring::new(4);
  ring.enqueue(10);
  ring.enqueue(20);
  ring.enqueue(30);
  ring.enqueue(40);

  assert_eq!(&40, ring.before(0));
  assert_eq!(&30, ring.before(1));
  assert_eq!(&20, ring.before(2));
  assert_eq!(&10, ring.before(3));

  // Wrap: 50 overwrites 10.
  ring.enqueue(50);
  assert_eq!(&50, ring.before(0));
  assert_eq!(&40, ring.before(1));
  assert_eq!(&30, ring.before(2));
  assert_eq!(&20, ring.before(3));

  ring.enqueue(60);
  assert_eq!(&60, ring.before(0));
  assert_eq!(&50, ring.before(1));
  assert_eq!(&40, ring.before(2));
  assert_eq!(&30, ring.before(3));
}

// After k enqueues into a ring of capacity c, before(n) is the (k - n)-th enqueued value for
// every n < min(k, c).
#[test]
fn positional_invariant() {
  for capacity in 1..=5 {
    let mut ring = Ring::new(capacity);
    for k in 1..=12_u64 {
      ring.enqueue(k);
      assert_eq!(&k, ring.latest());
      for n in 0..capacity.min(usize::try_from(k).unwrap()) {
        assert_eq!(&(k - n as u64), ring.before(n), "capacity {capacity}, k {k}, n {n}");
      }
    }
  }
}

#[test]
fn capacity_one() {
  let mut ring = Ring::new(1);
  ring.enqueue(7);
  assert_eq!(&7, ring.latest());
  assert_eq!(&7, ring.before(0));

  ring.enqueue(8);
  assert_eq!(&8, ring.latest());
  assert_eq!(&8, ring.before(0));
  assert_eq!(2, ring.count());
}

#[test]
fn non_copy_values() {
  let mut ring = Ring::new(2);
  ring.enqueue("first".to_string());
  ring.enqueue("second".to_string());
  assert_eq!("second", ring.latest());
  assert_eq!("first", ring.before(1));

  ring.enqueue("third".to_string());
  assert_eq!("third", ring.latest());
  assert_eq!("second", ring.before(1));
}
