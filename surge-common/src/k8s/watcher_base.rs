// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::shutdown::ComponentShutdown;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures_util::{TryStreamExt, pin_mut};
use kube::runtime::watcher::{self, ListSemantic};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use time::ext::NumericalStdDuration;
use tokio::sync::oneshot;

/// Callbacks dispatched from a resource watch. `init_apply`/`init_done` are delivered during the
/// initial list (and every re-list after a watch failure); `apply`/`delete` afterwards.
#[async_trait]
pub trait ResourceWatchCallbacks<T>: Send {
  async fn apply(&mut self, resource: T);
  async fn delete(&mut self, resource: T);
  async fn init_apply(&mut self, resource: T);
  async fn init_done(&mut self);
}

pub struct WatcherBase {}

impl WatcherBase {
  /// Spawns the watch loop and returns once the initial resource sync has completed, so callers
  /// can rely on the first snapshot being present.
  pub async fn create<T: Resource + Clone + DeserializeOwned + Debug + Send + 'static>(
    name: String,
    api: Api<T>,
    label_selector: Option<String>,
    mut callbacks: impl ResourceWatchCallbacks<T> + 'static,
    mut shutdown: ComponentShutdown,
  ) {
    // Page size must stay unset so the client sends resourceVersion=0, see
    // https://github.com/kubernetes/kubernetes/issues/118394
    let watcher = watcher::watcher(
      api,
      watcher::Config {
        label_selector,
        list_semantic: ListSemantic::Any,
        page_size: None,
        ..Default::default()
      },
    );

    let (initial_sync_tx, initial_sync_rx) = oneshot::channel();
    let cloned_name = name.clone();
    tokio::spawn(async move {
      pin_mut!(watcher);
      let mut initial_sync_tx = Some(initial_sync_tx);
      let mut backoff = Self::make_k8s_backoff();
      loop {
        let update = tokio::select! {
          () = shutdown.cancelled() => {
            log::info!("{name}: shutting down resource watcher");
            break;
          },
          update = watcher.try_next() => update,
        };

        let update = match update {
          Ok(Some(update)) => {
            // The watcher emits Event::Init at the start of every re-list, including the re-list
            // that follows a failure, so resetting there would defeat the backoff.
            if !matches!(update, watcher::Event::Init) {
              backoff.reset();
            }
            update
          },
          Ok(None) => continue,
          Err(e) => {
            log::warn!("{name}: error watching resource, backing off: {e}");
            tokio::time::sleep(backoff.next_backoff().unwrap()).await;
            continue;
          },
        };

        match update {
          watcher::Event::Apply(resource) => {
            log::debug!("{name}: resource apply");
            callbacks.apply(resource).await;
          },
          watcher::Event::Delete(resource) => callbacks.delete(resource).await,
          watcher::Event::Init => {
            log::info!("{name}: starting resource resync");
          },
          watcher::Event::InitApply(resource) => callbacks.init_apply(resource).await,
          watcher::Event::InitDone => {
            callbacks.init_done().await;
            log::info!("{name}: resource resync complete");
            if let Some(initial_sync_tx) = initial_sync_tx.take() {
              let _ignored = initial_sync_tx.send(());
            }
          },
        }
      }
    });

    let _ignored = initial_sync_rx.await;
    log::info!("{cloned_name}: initial resource sync complete");
  }

  // Matches the Go client's watch backoff.
  fn make_k8s_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
      .with_initial_interval(800.std_milliseconds())
      .with_max_interval(30.std_seconds())
      .with_max_elapsed_time(None)
      .with_multiplier(2.0)
      .build()
  }
}
