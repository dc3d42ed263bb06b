// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./scaler_test.rs"]
mod scaler_test;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use mockall::automock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use surge_common::k8s::endpoints::MetricsAddrCache;
use surge_common::k8s::ingress_controller::EMPTY_INGRESS_CLASS;
use surge_metrics::counter_cache::{CounterCache, Ticker, interval_ticker_factory};
use surge_protobuf::protos::externalscaler::external_scaler_server::ExternalScaler;
use surge_protobuf::protos::externalscaler::{
  GetMetricSpecResponse,
  GetMetricsRequest,
  GetMetricsResponse,
  IsActiveResponse,
  MetricSpec,
  MetricValue,
  ScaledObjectRef,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

/// The controller metric family the QPS signal is derived from.
pub const METRICS_NAME: &str = "nginx_ingress_controller_requests";

/// The metric name reported to the outer autoscaler.
pub const EXTERNAL_METRIC_NAME: &str = "ingress-nginx-qps";

const STREAM_INTERVAL: Duration = Duration::from_secs(60);

// Tickers for both the scrape loops and the IsActive streams come through here so tests can
// drive time by hand.
type DurationTickerFactory = Arc<dyn Fn(Duration) -> Box<dyn Ticker> + Send + Sync>;

//
// IngressClassResolver
//

#[automock]
#[async_trait]
pub trait IngressClassResolver: Send + Sync {
  /// The `ingressClassName` of the named ingress object, if it has one.
  async fn ingress_class(&self, namespace: &str, name: &str) -> anyhow::Result<Option<String>>;
}

pub struct RealIngressClassResolver {
  client: kube::Client,
}

impl RealIngressClassResolver {
  #[must_use]
  pub const fn new(client: kube::Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl IngressClassResolver for RealIngressClassResolver {
  async fn ingress_class(&self, namespace: &str, name: &str) -> anyhow::Result<Option<String>> {
    let ingress_api: kube::Api<Ingress> = kube::Api::namespaced(self.client.clone(), namespace);
    let ingress = ingress_api.get(name).await?;
    Ok(ingress.spec.and_then(|spec| spec.ingress_class_name))
  }
}

//
// ScalerMetadata
//

// The per-call configuration carried in the scaledObject's metadata map.
struct ScalerMetadata {
  namespace: String,
  name: String,

  ingress_name: String,
  ingress_class_glob: String,

  period: Duration,
  qps: Option<i64>,
}

//
// IngressNginxScaler
//

struct Inner {
  resolver: Box<dyn IngressClassResolver>,
  directory: Arc<MetricsAddrCache>,

  interval: Duration,
  cache_duration: Duration,
  scrape_timeout: Duration,
  ticker_factory: DurationTickerFactory,

  // glob -> counter cache, created lazily on the first request for the glob.
  metrics_caches: Mutex<HashMap<String, Arc<CounterCache>>>,
}

/// The external-scaler service: maps scaledObject metadata onto per-glob counter caches and
/// answers the four operations of the protocol.
#[derive(Clone)]
pub struct IngressNginxScaler {
  inner: Arc<Inner>,
}

impl IngressNginxScaler {
  #[must_use]
  pub fn new(
    resolver: Box<dyn IngressClassResolver>,
    directory: Arc<MetricsAddrCache>,
    interval: Duration,
    cache_duration: Duration,
    scrape_timeout: Duration,
  ) -> Self {
    Self::with_ticker_factory(
      resolver,
      directory,
      interval,
      cache_duration,
      scrape_timeout,
      Arc::new(|interval| interval_ticker_factory(interval)()),
    )
  }

  fn with_ticker_factory(
    resolver: Box<dyn IngressClassResolver>,
    directory: Arc<MetricsAddrCache>,
    interval: Duration,
    cache_duration: Duration,
    scrape_timeout: Duration,
    ticker_factory: DurationTickerFactory,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        resolver,
        directory,
        interval,
        cache_duration,
        scrape_timeout,
        ticker_factory,
        metrics_caches: Mutex::new(HashMap::new()),
      }),
    }
  }
}

impl Inner {
  // Looks up or creates the counter cache for a glob. Creation subscribes to the endpoint
  // directory and spawns the scrape loop; the single lock guarantees exactly one cache (and one
  // loop) per glob under concurrent first use.
  fn metrics_cache(&self, glob: &str) -> Arc<CounterCache> {
    let mut caches = self.metrics_caches.lock();
    if let Some(cache) = caches.get(glob) {
      return cache.clone();
    }

    let updates_rx = self.directory.subscribe(glob);
    let ticker_factory = self.ticker_factory.clone();
    let interval = self.interval;
    let mut cache = CounterCache::with_ticker_factory(
      METRICS_NAME,
      self.interval,
      self.cache_duration,
      self.scrape_timeout,
      updates_rx,
      Box::new(move || ticker_factory(interval)),
    );
    cache.set_index_fn(Box::new(|labels| {
      labels.get("ingress").cloned().unwrap_or_default()
    }));
    let cache = Arc::new(cache);
    caches.insert(glob.to_string(), cache.clone());

    tokio::spawn(cache.clone().run());
    cache
  }

  async fn parse_metadata(
    &self,
    scaled_object: &ScaledObjectRef,
    require_qps: bool,
  ) -> Result<ScalerMetadata, Status> {
    let namespace = &scaled_object.namespace;
    let name = &scaled_object.name;

    let ingress_name = match scaled_object.scaler_metadata.get("ingressName") {
      Some(ingress_name) if !ingress_name.is_empty() => ingress_name.clone(),
      _ => {
        log::error!("scaled object {namespace}/{name} ingressName must be specified");
        return Err(Status::invalid_argument("ingressName must be specified and not empty"));
      },
    };

    let period = match scaled_object.scaler_metadata.get("period") {
      Some(period) if !period.is_empty() => {
        humantime::parse_duration(period).map_err(|e| Status::invalid_argument(e.to_string()))?
      },
      _ => {
        log::error!("scaled object {namespace}/{name} period must be specified");
        return Err(Status::invalid_argument("period must be specified"));
      },
    };
    if period > self.cache_duration {
      log::error!(
        "scaled object {namespace}/{name} period {period:?} exceeds the retained window {:?}",
        self.cache_duration
      );
      return Err(Status::invalid_argument("period must not exceed the retained window"));
    }

    let qps = if require_qps {
      match scaled_object.scaler_metadata.get("qps") {
        Some(qps) if !qps.is_empty() => Some(qps.parse::<i64>().map_err(|_| {
          log::error!("scaled object {namespace}/{name} qps {qps:?} is not an integer");
          Status::invalid_argument("qps must be an integer")
        })?),
        _ => {
          log::error!("scaled object {namespace}/{name} qps must be specified");
          return Err(Status::invalid_argument("qps must be specified"));
        },
      }
    } else {
      None
    };

    let ingress_class = match scaled_object.scaler_metadata.get("ingressClass") {
      Some(ingress_class) if !ingress_class.is_empty() => ingress_class.clone(),
      _ => self
        .resolver
        .ingress_class(namespace, &ingress_name)
        .await
        .map_err(|e| {
          log::error!("scaled object {namespace}/{name} get ingress err: {e}");
          Status::internal(e.to_string())
        })?
        .unwrap_or_else(|| EMPTY_INGRESS_CLASS.to_string()),
    };
    log::debug!("scaled object {namespace}/{name} resolved ingress class '{ingress_class}'");

    Ok(ScalerMetadata {
      namespace: namespace.clone(),
      name: name.clone(),
      ingress_name,
      ingress_class_glob: format!("{ingress_class}-*"),
      period,
      qps,
    })
  }
}

#[async_trait]
impl ExternalScaler for IngressNginxScaler {
  async fn is_active(
    &self,
    request: Request<ScaledObjectRef>,
  ) -> Result<Response<IsActiveResponse>, Status> {
    let scaled_object = request.into_inner();
    log::debug!(
      "IsActive called, scaled object: {}/{}",
      scaled_object.namespace,
      scaled_object.name
    );
    let metadata = self.inner.parse_metadata(&scaled_object, false).await?;

    let cache = self.inner.metrics_cache(&metadata.ingress_class_glob);
    Ok(Response::new(IsActiveResponse {
      result: cache.active(&metadata.ingress_name, metadata.period),
    }))
  }

  type StreamIsActiveStream = ReceiverStream<Result<IsActiveResponse, Status>>;

  async fn stream_is_active(
    &self,
    request: Request<ScaledObjectRef>,
  ) -> Result<Response<Self::StreamIsActiveStream>, Status> {
    let scaled_object = request.into_inner();
    log::debug!(
      "StreamIsActive called, scaled object: {}/{}",
      scaled_object.namespace,
      scaled_object.name
    );
    let metadata = self.inner.parse_metadata(&scaled_object, false).await?;

    let (tx, rx) = mpsc::channel(1);
    let inner = self.inner.clone();
    tokio::spawn(async move {
      let mut ticker = (inner.ticker_factory)(STREAM_INTERVAL);
      loop {
        tokio::select! {
          () = tx.closed() => {
            log::debug!(
              "scaled object {}/{} active stream cancelled",
              metadata.namespace,
              metadata.name
            );
            return;
          },
          () = ticker.next() => {
            // The cache is re-resolved on every tick so the stream starts scraping even when it
            // is the first caller for the glob.
            let cache = inner.metrics_cache(&metadata.ingress_class_glob);
            let result = cache.active(&metadata.ingress_name, metadata.period);
            if let Err(e) = tx.send(Ok(IsActiveResponse { result })).await {
              log::error!(
                "scaled object {}/{} send IsActiveResponse err: {e}",
                metadata.namespace,
                metadata.name
              );
            }
          },
        }
      }
    });

    Ok(Response::new(ReceiverStream::new(rx)))
  }

  async fn get_metric_spec(
    &self,
    request: Request<ScaledObjectRef>,
  ) -> Result<Response<GetMetricSpecResponse>, Status> {
    let scaled_object = request.into_inner();
    log::debug!(
      "GetMetricSpec called, scaled object: {}/{}",
      scaled_object.namespace,
      scaled_object.name
    );
    let metadata = self.inner.parse_metadata(&scaled_object, true).await?;

    // Resolving the cache here starts scraping for the glob before the first GetMetrics call.
    let _cache = self.inner.metrics_cache(&metadata.ingress_class_glob);

    Ok(Response::new(GetMetricSpecResponse {
      metric_specs: vec![MetricSpec {
        metric_name: EXTERNAL_METRIC_NAME.to_string(),
        target_size: metadata.qps.unwrap_or_default(),
        target_size_float: 0.0,
      }],
    }))
  }

  async fn get_metrics(
    &self,
    request: Request<GetMetricsRequest>,
  ) -> Result<Response<GetMetricsResponse>, Status> {
    let request = request.into_inner();
    let Some(scaled_object) = request.scaled_object_ref else {
      return Err(Status::invalid_argument("scaledObjectRef must be specified"));
    };
    log::debug!(
      "GetMetrics called, scaled object: {}/{}",
      scaled_object.namespace,
      scaled_object.name
    );
    let metadata = self.inner.parse_metadata(&scaled_object, false).await?;

    let cache = self.inner.metrics_cache(&metadata.ingress_class_glob);
    let latest = cache.latest(&metadata.ingress_name).map_err(|e| {
      log::error!(
        "scaled object {}/{} get latest metrics err: {e}",
        metadata.namespace,
        metadata.name
      );
      Status::internal(e.to_string())
    })?;
    let before = cache.before(&metadata.ingress_name, metadata.period).map_err(|e| {
      log::error!(
        "scaled object {}/{} get before metrics err: {e}",
        metadata.namespace,
        metadata.name
      );
      Status::internal(e.to_string())
    })?;

    let qps = (latest - before) / metadata.period.as_secs_f64();
    log::debug!(
      "scaled object {}/{} qps: {qps}, latest: {latest}, before: {before}",
      metadata.namespace,
      metadata.name
    );
    Ok(Response::new(GetMetricsResponse {
      metric_values: vec![MetricValue {
        metric_name: EXTERNAL_METRIC_NAME.to_string(),
        metric_value: 0,
        metric_value_float: qps,
      }],
    }))
  }
}
