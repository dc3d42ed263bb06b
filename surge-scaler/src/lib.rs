// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod scaler;

use anyhow::Context;
use clap::Parser;
use crate::scaler::{IngressNginxScaler, RealIngressClassResolver};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use surge_common::k8s::endpoints::{MetricsAddrCache, PodWatchCallbacks};
use surge_common::k8s::watcher_base::WatcherBase;
use surge_common::shutdown::ComponentShutdownTrigger;
use surge_protobuf::protos::externalscaler::external_scaler_server::ExternalScalerServer;

#[derive(Parser, Debug, Clone)]
pub struct Options {
  /// Port the external scaler gRPC service listens on.
  #[arg(long = "port", default_value_t = 9443)]
  pub port: u16,

  /// Path to a kubeconfig file. Empty means the in-cluster or environment config.
  #[arg(long = "kubeconfig", default_value = "")]
  pub kubeconfig: String,

  /// Label selector applied to the pod watch.
  #[arg(long = "label-selector")]
  pub label_selector: Option<String>,

  /// How often controller endpoints are scraped.
  #[arg(long = "interval", default_value = "10s")]
  pub interval: humantime::Duration,

  /// How much scrape history is retained per series.
  #[arg(long = "cache-duration", default_value = "5m")]
  pub cache_duration: humantime::Duration,

  /// Timeout for a single scrape. Defaults to the scrape interval.
  #[arg(long = "scrape-timeout")]
  pub scrape_timeout: Option<humantime::Duration>,
}

async fn make_kube_client(kubeconfig: &str) -> anyhow::Result<kube::Client> {
  if kubeconfig.is_empty() {
    return Ok(kube::Client::try_default().await?);
  }

  let kubeconfig = kube::config::Kubeconfig::read_from(kubeconfig)?;
  let config = kube::Config::from_custom_kubeconfig(
    kubeconfig,
    &kube::config::KubeConfigOptions::default(),
  )
  .await?;
  Ok(kube::Client::try_from(config)?)
}

/// Brings up pod discovery and serves the external-scaler contract until the shutdown future
/// resolves.
pub async fn run_server(
  options: Options,
  shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
  let interval: Duration = options.interval.into();
  let cache_duration: Duration = options.cache_duration.into();
  let scrape_timeout = options.scrape_timeout.map_or(interval, Into::into);
  anyhow::ensure!(!interval.is_zero(), "--interval must be positive");
  anyhow::ensure!(
    cache_duration >= interval,
    "--cache-duration must be at least --interval"
  );

  let client = make_kube_client(&options.kubeconfig)
    .await
    .context("failed to create Kubernetes client")?;

  let directory = MetricsAddrCache::new();
  let shutdown_trigger = ComponentShutdownTrigger::default();
  let pod_api: Api<Pod> = Api::all(client.clone());
  WatcherBase::create(
    "ingress controller pod watcher".to_string(),
    pod_api,
    options.label_selector.clone(),
    PodWatchCallbacks::new(directory.clone()),
    shutdown_trigger.make_shutdown(),
  )
  .await;

  let scaler = IngressNginxScaler::new(
    Box::new(RealIngressClassResolver::new(client)),
    directory,
    interval,
    cache_duration,
    scrape_timeout,
  );

  let addr = SocketAddr::from(([0, 0, 0, 0], options.port));
  log::info!("listening on {addr}");
  tonic::transport::Server::builder()
    .add_service(ExternalScalerServer::new(scaler))
    .serve_with_shutdown(addr, shutdown)
    .await
    .context("gRPC server failed")?;

  shutdown_trigger.shutdown().await;
  log::info!("runtime terminated");
  Ok(())
}
