// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{healthz_port, identity, is_ingress_controller, is_ready, metrics_addr};
use crate::k8s::test::{make_controller_pod, make_pod};
use k8s_openapi::api::core::v1::Container;
use pretty_assertions::assert_eq;

#[test]
fn controller_eligibility() {
  assert!(is_ingress_controller(&make_controller_pod(
    "pod-1",
    &[],
    Some("10.0.0.1"),
    true
  )));

  // Wrong container name.
  assert!(!is_ingress_controller(&make_pod(
    "pod-1",
    vec![Container {
      name: "sidecar".to_string(),
      args: Some(vec!["/nginx-ingress-controller".to_string()]),
      ..Default::default()
    }],
    Some("10.0.0.1"),
    true,
  )));

  // Wrong first argument.
  assert!(!is_ingress_controller(&make_pod(
    "pod-1",
    vec![Container {
      name: "controller".to_string(),
      args: Some(vec!["/other-binary".to_string()]),
      ..Default::default()
    }],
    Some("10.0.0.1"),
    true,
  )));

  // No arguments at all.
  assert!(!is_ingress_controller(&make_pod(
    "pod-1",
    vec![Container {
      name: "controller".to_string(),
      ..Default::default()
    }],
    Some("10.0.0.1"),
    true,
  )));

  // More than one container.
  assert!(!is_ingress_controller(&make_pod(
    "pod-1",
    vec![
      Container {
        name: "controller".to_string(),
        args: Some(vec!["/nginx-ingress-controller".to_string()]),
        ..Default::default()
      },
      Container {
        name: "sidecar".to_string(),
        ..Default::default()
      },
    ],
    Some("10.0.0.1"),
    true,
  )));
}

#[test]
fn identity_uses_class_and_name() {
  assert_eq!(
    "nginx-pod-1",
    identity(&make_controller_pod(
      "pod-1",
      &["--ingress-class=nginx"],
      Some("10.0.0.1"),
      true
    ))
    .unwrap()
  );

  // Without an --ingress-class argument the sentinel class is used.
  assert_eq!(
    "nginx_ingress_empty-pod-1",
    identity(&make_controller_pod("pod-1", &[], Some("10.0.0.1"), true)).unwrap()
  );

  assert!(identity(&make_pod("pod-1", vec![], Some("10.0.0.1"), true)).is_err());
}

#[test]
fn healthz_port_extraction() {
  assert_eq!(
    10254,
    healthz_port(&make_controller_pod("pod-1", &[], Some("10.0.0.1"), true)).unwrap()
  );
  assert_eq!(
    9999,
    healthz_port(&make_controller_pod(
      "pod-1",
      &["--healthz-port=9999"],
      Some("10.0.0.1"),
      true
    ))
    .unwrap()
  );
  assert!(
    healthz_port(&make_controller_pod(
      "pod-1",
      &["--healthz-port=not-a-port"],
      Some("10.0.0.1"),
      true
    ))
    .is_err()
  );
}

#[test]
fn metrics_addr_format() {
  assert_eq!(
    "http://10.0.0.1:10254/metrics",
    metrics_addr(&make_controller_pod("pod-1", &[], Some("10.0.0.1"), true)).unwrap()
  );
  assert_eq!(
    "http://10.0.0.1:9113/metrics",
    metrics_addr(&make_controller_pod(
      "pod-1",
      &["--healthz-port=9113"],
      Some("10.0.0.1"),
      true
    ))
    .unwrap()
  );
  assert!(metrics_addr(&make_controller_pod("pod-1", &[], None, true)).is_err());
}

#[test]
fn readiness() {
  assert!(is_ready(&make_controller_pod("pod-1", &[], Some("10.0.0.1"), true)));
  assert!(!is_ready(&make_controller_pod("pod-1", &[], Some("10.0.0.1"), false)));

  let mut pod = make_controller_pod("pod-1", &[], Some("10.0.0.1"), true);
  pod.status = None;
  assert!(!is_ready(&pod));
}
