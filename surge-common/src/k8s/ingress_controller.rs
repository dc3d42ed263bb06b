// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./ingress_controller_test.rs"]
mod ingress_controller_test;

use anyhow::{anyhow, bail};
use k8s_openapi::api::core::v1::{Container, Pod};

/// Sentinel class used when an ingress-controller pod does not carry an `--ingress-class`
/// argument (and when an ingress object has no class name).
pub const EMPTY_INGRESS_CLASS: &str = "nginx_ingress_empty";

pub const DEFAULT_HEALTHZ_PORT: u16 = 10254;

const CONTROLLER_CONTAINER_NAME: &str = "controller";
const CONTROLLER_COMMAND: &str = "/nginx-ingress-controller";
const INGRESS_CLASS_ARG: &str = "--ingress-class=";
const HEALTHZ_PORT_ARG: &str = "--healthz-port=";

// An ingress-controller pod runs a single container named "controller" whose first argument is
// the nginx controller binary.
fn controller_container(pod: &Pod) -> Option<&Container> {
  let containers = pod.spec.as_ref().map_or(&[][..], |spec| spec.containers.as_slice());
  let [container] = containers else {
    return None;
  };
  if container.name != CONTROLLER_CONTAINER_NAME {
    return None;
  }
  if container.args.as_ref().and_then(|args| args.first()).map(String::as_str)
    != Some(CONTROLLER_COMMAND)
  {
    return None;
  }
  Some(container)
}

#[must_use]
pub fn is_ingress_controller(pod: &Pod) -> bool {
  controller_container(pod).is_some()
}

fn container_arg_value<'a>(container: &'a Container, prefix: &str) -> Option<&'a str> {
  container
    .args
    .as_ref()
    .map_or(&[][..], |args| args.as_slice())
    .iter()
    .find_map(|arg| arg.strip_prefix(prefix))
}

/// The canonical `"<ingress-class>-<pod-name>"` key used to match controller pods against
/// subscriber globs.
pub fn identity(pod: &Pod) -> anyhow::Result<String> {
  let container =
    controller_container(pod).ok_or_else(|| anyhow!("pod is not an ingress controller"))?;
  let name = pod
    .metadata
    .name
    .as_deref()
    .ok_or_else(|| anyhow!("pod has no name"))?;
  let class = container_arg_value(container, INGRESS_CLASS_ARG).unwrap_or(EMPTY_INGRESS_CLASS);
  Ok(format!("{class}-{name}"))
}

/// The port the controller serves /metrics on, from the `--healthz-port` argument. A missing
/// argument means the upstream default; an unparseable one is an error and the pod is dropped
/// from discovery.
pub fn healthz_port(pod: &Pod) -> anyhow::Result<u16> {
  let container =
    controller_container(pod).ok_or_else(|| anyhow!("pod is not an ingress controller"))?;
  let Some(value) = container_arg_value(container, HEALTHZ_PORT_ARG) else {
    return Ok(DEFAULT_HEALTHZ_PORT);
  };
  value
    .parse()
    .map_err(|e| anyhow!("failed to parse healthz port {value:?}: {e}"))
}

pub fn metrics_addr(pod: &Pod) -> anyhow::Result<String> {
  let Some(pod_ip) = pod.status.as_ref().and_then(|status| status.pod_ip.as_deref()) else {
    bail!("pod has no allocated IP");
  };
  let port = healthz_port(pod)?;
  Ok(format!("http://{pod_ip}:{port}/metrics"))
}

#[must_use]
pub fn is_ready(pod: &Pod) -> bool {
  pod
    .status
    .as_ref()
    .and_then(|status| status.conditions.as_ref())
    .is_some_and(|conditions| {
      conditions
        .iter()
        .any(|condition| condition.type_ == "Ready" && condition.status == "True")
    })
}
