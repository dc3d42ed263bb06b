// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use k8s_openapi::api::core::v1::{Container, Pod, PodCondition, PodSpec, PodStatus};
use kube::api::ObjectMeta;

#[must_use]
pub fn make_pod_status(ip: Option<&str>, ready: bool) -> Option<PodStatus> {
  Some(PodStatus {
    pod_ip: ip.map(ToString::to_string),
    conditions: Some(vec![PodCondition {
      type_: "Ready".to_string(),
      status: if ready { "True" } else { "False" }.to_string(),
      ..Default::default()
    }]),
    ..Default::default()
  })
}

#[must_use]
pub fn make_pod(name: &str, containers: Vec<Container>, ip: Option<&str>, ready: bool) -> Pod {
  Pod {
    metadata: ObjectMeta {
      name: Some(name.to_string()),
      namespace: Some("default".to_string()),
      ..Default::default()
    },
    spec: Some(PodSpec {
      containers,
      ..Default::default()
    }),
    status: make_pod_status(ip, ready),
  }
}

/// A pod that passes the ingress-controller eligibility checks. `extra_args` follow the
/// controller binary, e.g. `&["--ingress-class=nginx"]`.
#[must_use]
pub fn make_controller_pod(
  name: &str,
  extra_args: &[&str],
  ip: Option<&str>,
  ready: bool,
) -> Pod {
  let mut args = vec!["/nginx-ingress-controller".to_string()];
  args.extend(extra_args.iter().map(ToString::to_string));
  make_pod(
    name,
    vec![Container {
      name: "controller".to_string(),
      args: Some(args),
      ..Default::default()
    }],
    ip,
    ready,
  )
}
