// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{MetricsAddrCache, PodWatchCallbacks, glob_matches};
use crate::k8s::test::make_controller_pod;
use crate::k8s::watcher_base::ResourceWatchCallbacks;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::time::Duration;

async fn assert_no_message(rx: &mut tokio::sync::mpsc::Receiver<Vec<String>>) {
  assert!(
    tokio::time::timeout(Duration::from_millis(50), rx.recv())
      .await
      .is_err()
  );
}

#[test]
fn glob_dialect() {
  assert!(glob_matches("nginx-*", "nginx-pod-1"));
  assert!(glob_matches("nginx-pod-?", "nginx-pod-1"));
  assert!(glob_matches("nginx-pod-[12]", "nginx-pod-1"));
  assert!(!glob_matches("nginx-*", "haproxy-pod-1"));

  // A malformed pattern is a non-match, not an error.
  assert!(!glob_matches("nginx-[", "nginx-pod-1"));
}

#[tokio::test]
async fn matches_by_glob() {
  let cache = MetricsAddrCache::new();
  cache
    .apply_pod(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      true,
    ))
    .await;
  cache
    .apply_pod(&make_controller_pod(
      "pod-2",
      &["--ingress-class=nginx"],
      Some("10.0.0.2"),
      true,
    ))
    .await;
  cache
    .apply_pod(&make_controller_pod(
      "pod-3",
      &["--ingress-class=haproxy"],
      Some("10.0.0.3"),
      true,
    ))
    .await;

  assert_eq!(
    vec![
      "http://10.0.0.1:10254/metrics".to_string(),
      "http://10.0.0.2:10254/metrics".to_string(),
    ],
    cache.matches("nginx-*")
  );
  assert_eq!(
    vec!["http://10.0.0.3:10254/metrics".to_string()],
    cache.matches("haproxy-*")
  );
  assert!(cache.matches("traefik-*").is_empty());
  assert!(cache.matches("nginx-[").is_empty());
}

#[tokio::test]
async fn not_ready_pods_are_never_reported() {
  let cache = MetricsAddrCache::new();
  cache
    .apply_pod(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      false,
    ))
    .await;
  assert!(cache.matches("nginx-*").is_empty());

  // Becomes ready, then transitions back out of ready.
  cache
    .apply_pod(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      true,
    ))
    .await;
  assert_eq!(1, cache.matches("nginx-*").len());

  let mut rx = cache.subscribe("nginx-*");
  assert_eq!(
    Some(vec!["http://10.0.0.1:10254/metrics".to_string()]),
    rx.recv().await
  );
  cache
    .apply_pod(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      false,
    ))
    .await;
  assert_eq!(Some(Vec::new()), rx.recv().await);
  assert!(cache.matches("nginx-*").is_empty());
}

#[tokio::test]
async fn ready_pod_without_ip_is_dropped() {
  let cache = MetricsAddrCache::new();
  cache
    .apply_pod(&make_controller_pod("pod-1", &["--ingress-class=nginx"], None, true))
    .await;

  assert!(cache.matches("nginx-*").is_empty());
  assert_eq!(1, cache.stats.pod_drop.get());
}

#[tokio::test]
async fn ready_pod_with_bad_healthz_port_is_dropped() {
  let cache = MetricsAddrCache::new();
  cache
    .apply_pod(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx", "--healthz-port=nope"],
      Some("10.0.0.1"),
      true,
    ))
    .await;

  assert!(cache.matches("nginx-*").is_empty());
  assert_eq!(1, cache.stats.pod_drop.get());
}

#[tokio::test]
async fn subscriptions_receive_snapshots() {
  let cache = MetricsAddrCache::new();
  let mut rx = cache.subscribe("nginx-*");

  // Subscribing seeds the channel with the current (empty) snapshot.
  assert_eq!(Some(Vec::new()), rx.recv().await);

  cache
    .apply_pod(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      true,
    ))
    .await;
  assert_eq!(
    Some(vec!["http://10.0.0.1:10254/metrics".to_string()]),
    rx.recv().await
  );

  // A mutation for a non-matching identity produces no message.
  cache
    .apply_pod(&make_controller_pod(
      "pod-2",
      &["--ingress-class=haproxy"],
      Some("10.0.0.2"),
      true,
    ))
    .await;
  assert_no_message(&mut rx).await;

  cache
    .apply_pod(&make_controller_pod(
      "pod-3",
      &["--ingress-class=nginx"],
      Some("10.0.0.3"),
      true,
    ))
    .await;
  assert_eq!(
    Some(vec![
      "http://10.0.0.1:10254/metrics".to_string(),
      "http://10.0.0.3:10254/metrics".to_string(),
    ]),
    rx.recv().await
  );

  // Deletion notifies with the shrunken list.
  cache
    .remove_pod(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      true,
    ))
    .await;
  assert_eq!(
    Some(vec!["http://10.0.0.3:10254/metrics".to_string()]),
    rx.recv().await
  );
}

#[tokio::test]
async fn unsubscribe_closes_channel() {
  let cache = MetricsAddrCache::new();
  let mut rx = cache.subscribe("nginx-*");
  cache.unsubscribe("nginx-*");

  // The seeded snapshot is still delivered, then the channel is closed.
  assert_eq!(Some(Vec::new()), rx.recv().await);
  assert_eq!(None, rx.recv().await);

  // A mutation after unsubscribe must not panic or send anywhere.
  cache
    .apply_pod(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      true,
    ))
    .await;
}

#[tokio::test]
async fn duplicate_subscribe_replaces_channel() {
  let cache = MetricsAddrCache::new();
  let mut first_rx = cache.subscribe("nginx-*");
  let mut second_rx = cache.subscribe("nginx-*");

  // The first channel is closed by the replacement once its seeded snapshot is drained.
  assert_eq!(Some(Vec::new()), first_rx.recv().await);
  assert_eq!(None, first_rx.recv().await);
  assert_eq!(Some(Vec::new()), second_rx.recv().await);

  cache
    .apply_pod(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      true,
    ))
    .await;
  assert_eq!(
    Some(vec!["http://10.0.0.1:10254/metrics".to_string()]),
    second_rx.recv().await
  );

  // Replacing a subscription that still has an unread mutation snapshot queued: the old
  // receiver drains the buffered message and then sees the close, the new one is seeded with
  // the current state.
  cache
    .apply_pod(&make_controller_pod(
      "pod-2",
      &["--ingress-class=nginx"],
      Some("10.0.0.2"),
      true,
    ))
    .await;
  let mut third_rx = cache.subscribe("nginx-*");

  assert_eq!(
    Some(vec![
      "http://10.0.0.1:10254/metrics".to_string(),
      "http://10.0.0.2:10254/metrics".to_string(),
    ]),
    second_rx.recv().await
  );
  assert_eq!(None, second_rx.recv().await);
  assert_eq!(
    Some(vec![
      "http://10.0.0.1:10254/metrics".to_string(),
      "http://10.0.0.2:10254/metrics".to_string(),
    ]),
    third_rx.recv().await
  );
}

#[tokio::test]
async fn resync_swaps_state() {
  let cache = MetricsAddrCache::new();
  let mut callbacks = PodWatchCallbacks::new(cache.clone());

  // Pre-resync state with a pod that will be gone after the re-list.
  cache
    .apply_pod(&make_controller_pod(
      "stale-pod",
      &["--ingress-class=nginx"],
      Some("10.0.0.9"),
      true,
    ))
    .await;
  let mut rx = cache.subscribe("nginx-*");
  assert_eq!(
    Some(vec!["http://10.0.0.9:10254/metrics".to_string()]),
    rx.recv().await
  );

  callbacks
    .init_apply(make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      true,
    ))
    .await;
  callbacks
    .init_apply(make_controller_pod(
      "pod-2",
      &["--ingress-class=nginx"],
      Some("10.0.0.2"),
      false,
    ))
    .await;
  callbacks.init_done().await;

  // Only the ready pod from the re-list survives; the stale entry is gone.
  assert_eq!(
    Some(vec!["http://10.0.0.1:10254/metrics".to_string()]),
    rx.recv().await
  );
  assert_eq!(
    vec!["http://10.0.0.1:10254/metrics".to_string()],
    cache.matches("nginx-*")
  );
}

#[tokio::test]
async fn empty_resync_clears_state() {
  let cache = MetricsAddrCache::new();
  let mut callbacks = PodWatchCallbacks::new(cache.clone());
  cache
    .apply_pod(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      true,
    ))
    .await;

  callbacks.init_done().await;
  assert_eq!(HashMap::default(), cache.state.lock().addrs.clone());
}
