// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./endpoints_test.rs"]
mod endpoints_test;

use super::ingress_controller;
use super::watcher_base::ResourceWatchCallbacks;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

// Shell-style matching (?, *, [..]), same dialect Go's filepath.Match uses. A malformed pattern
// never matches and never fails the caller.
fn glob_matches(pattern: &str, identity: &str) -> bool {
  glob::Pattern::new(pattern).is_ok_and(|pattern| pattern.matches(identity))
}

//
// Stats
//

struct Stats {
  pod_drop: IntCounter,
}

impl Default for Stats {
  fn default() -> Self {
    Self {
      pod_drop: IntCounter::new(
        "discovery_pod_drop",
        "Ready ingress-controller pods dropped because identity or address extraction failed",
      )
      .unwrap(),
    }
  }
}

//
// MetricsAddrCache
//

#[derive(Default)]
struct State {
  // identity -> scrape URL, Ready controller pods only.
  addrs: HashMap<String, String>,
  // glob pattern -> subscription channel.
  subscriptions: HashMap<String, mpsc::Sender<Vec<String>>>,
}

/// Tracks the scrape addresses of Ready ingress-controller pods, keyed by their
/// `"<class>-<name>"` identity, and pushes glob-filtered address snapshots to subscribers on
/// every mutation. Mutations arrive only from the pod watcher dispatch; `subscribe`/`matches`
/// are synchronous queries from RPC handlers.
#[derive(Default)]
pub struct MetricsAddrCache {
  state: Mutex<State>,
  stats: Stats,
}

impl MetricsAddrCache {
  #[must_use]
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Registers `glob` and returns the channel that will receive the full address list for the
  /// glob after every matching mutation, seeded with an initial snapshot so subscribers created
  /// after discovery has settled still learn the current set. A second subscription for the same
  /// glob replaces (and closes) the first.
  pub fn subscribe(&self, glob: &str) -> mpsc::Receiver<Vec<String>> {
    let (tx, rx) = mpsc::channel(1);
    let mut state = self.state.lock();
    // A fresh capacity-1 channel always has room for the snapshot.
    let _ignored = tx.try_send(Self::matches_locked(&state, glob));
    if state.subscriptions.insert(glob.to_string(), tx).is_some() {
      log::warn!("replacing existing subscription for glob '{glob}'");
    }
    rx
  }

  /// Closes the subscription channel and removes the registration. Subscribers observe the close
  /// as end-of-stream.
  pub fn unsubscribe(&self, glob: &str) {
    self.state.lock().subscriptions.remove(glob);
  }

  /// Synchronous snapshot of the addresses whose identity matches `glob`.
  #[must_use]
  pub fn matches(&self, glob: &str) -> Vec<String> {
    Self::matches_locked(&self.state.lock(), glob)
  }

  fn matches_locked(state: &State, glob: &str) -> Vec<String> {
    let mut addrs: Vec<String> = state
      .addrs
      .iter()
      .filter(|(identity, _)| glob_matches(glob, identity))
      .map(|(_, addr)| addr.clone())
      .collect();
    addrs.sort();
    addrs
  }

  pub async fn apply_pod(&self, pod: &Pod) {
    if !ingress_controller::is_ready(pod) {
      // A controller leaving Ready must stop being scraped even if the pod object lingers.
      let Ok(identity) = ingress_controller::identity(pod) else {
        return;
      };
      let removed = self.state.lock().addrs.remove(&identity).is_some();
      if removed {
        log::info!("removing pod '{identity}', no longer ready");
        self.trigger_watch(&identity).await;
      }
      return;
    }

    let Some((identity, addr)) = self.endpoint_entry(pod) else {
      return;
    };
    log::info!("adding pod '{identity}' with address '{addr}'");
    self.state.lock().addrs.insert(identity.clone(), addr);
    self.trigger_watch(&identity).await;
  }

  pub async fn remove_pod(&self, pod: &Pod) {
    let Ok(identity) = ingress_controller::identity(pod) else {
      return;
    };
    log::info!("removing pod '{identity}'");
    self.state.lock().addrs.remove(&identity);
    self.trigger_watch(&identity).await;
  }

  /// Replaces the full address map after a watch re-list and re-notifies every subscription.
  pub async fn swap_state(&self, new_addrs: HashMap<String, String>) {
    let to_send = {
      let mut state = self.state.lock();
      state.addrs = new_addrs;
      log::info!("pod resync complete with {} scrape endpoints", state.addrs.len());
      state.subscriptions.retain(|_, tx| !tx.is_closed());
      state
        .subscriptions
        .iter()
        .map(|(glob, tx)| (tx.clone(), Self::matches_locked(&state, glob)))
        .collect::<Vec<_>>()
    };

    for (tx, addrs) in to_send {
      let _ignored = tx.send(addrs).await;
    }
  }

  fn endpoint_entry(&self, pod: &Pod) -> Option<(String, String)> {
    let identity = match ingress_controller::identity(pod) {
      Ok(identity) => identity,
      Err(e) => {
        log::debug!("skipping pod '{}': {e}", pod.metadata.name.as_deref().unwrap_or_default());
        return None;
      },
    };

    match ingress_controller::metrics_addr(pod) {
      Ok(addr) => Some((identity, addr)),
      Err(e) => {
        log::error!("failed to get metrics address for pod '{identity}': {e}");
        self.stats.pod_drop.inc();
        None
      },
    }
  }

  // Sends the current address list for every glob that matches the mutated identity. Senders are
  // cloned out of the lock so a slow subscriber only blocks this dispatch, never the synchronous
  // queries.
  async fn trigger_watch(&self, identity: &str) {
    let to_send = {
      let mut state = self.state.lock();
      state.subscriptions.retain(|_, tx| !tx.is_closed());
      state
        .subscriptions
        .iter()
        .filter(|(glob, _)| glob_matches(glob, identity))
        .map(|(glob, tx)| (tx.clone(), Self::matches_locked(&state, glob)))
        .collect::<Vec<_>>()
    };

    for (tx, addrs) in to_send {
      let _ignored = tx.send(addrs).await;
    }
  }
}

//
// PodWatchCallbacks
//

/// Adapts pod watch events onto the cache. Re-list replays are accumulated into a fresh map and
/// swapped in at `init_done` so entries for pods that disappeared while the watch was broken do
/// not linger.
pub struct PodWatchCallbacks {
  cache: Arc<MetricsAddrCache>,
  initializing_state: Option<HashMap<String, String>>,
}

impl PodWatchCallbacks {
  #[must_use]
  pub fn new(cache: Arc<MetricsAddrCache>) -> Self {
    Self {
      cache,
      initializing_state: None,
    }
  }
}

#[async_trait]
impl ResourceWatchCallbacks<Pod> for PodWatchCallbacks {
  async fn apply(&mut self, pod: Pod) {
    self.cache.apply_pod(&pod).await;
  }

  async fn delete(&mut self, pod: Pod) {
    self.cache.remove_pod(&pod).await;
  }

  async fn init_apply(&mut self, pod: Pod) {
    if !ingress_controller::is_ready(&pod) {
      return;
    }
    if let Some((identity, addr)) = self.cache.endpoint_entry(&pod) {
      self
        .initializing_state
        .get_or_insert_with(HashMap::default)
        .insert(identity, addr);
    }
  }

  async fn init_done(&mut self) {
    let new_state = self.initializing_state.take().unwrap_or_default();
    self.cache.swap_state(new_state).await;
  }
}
