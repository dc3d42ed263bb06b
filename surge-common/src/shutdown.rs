// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;

//
// ComponentShutdownTrigger
//

/// Owns the shutdown signal for a set of components. Dropping or calling `shutdown()` cancels
/// every `ComponentShutdown` handed out by this trigger; `shutdown()` additionally waits for all
/// of them to be dropped by their owners.
pub struct ComponentShutdownTrigger {
  token: CancellationToken,
  tracker: TaskTracker,
}

impl Default for ComponentShutdownTrigger {
  fn default() -> Self {
    Self {
      token: CancellationToken::new(),
      tracker: TaskTracker::new(),
    }
  }
}

impl ComponentShutdownTrigger {
  #[must_use]
  pub fn make_shutdown(&self) -> ComponentShutdown {
    ComponentShutdown {
      token: self.token.clone(),
      tracker_token: self.tracker.token(),
    }
  }

  pub async fn shutdown(self) {
    self.token.cancel();
    self.tracker.close();
    self.tracker.wait().await;
  }
}

//
// ComponentShutdown
//

/// Held by a component for the duration of its run loop. The component must drop this handle when
/// it observes cancellation, which is what completes the trigger side.
#[derive(Clone)]
pub struct ComponentShutdown {
  token: CancellationToken,
  #[allow(dead_code)]
  tracker_token: TaskTrackerToken,
}

impl ComponentShutdown {
  pub async fn cancelled(&mut self) {
    self.token.cancelled().await;
  }
}

#[cfg(test)]
mod tests {
  use super::ComponentShutdownTrigger;

  #[tokio::test]
  async fn shutdown_waits_for_components() {
    let trigger = ComponentShutdownTrigger::default();
    let mut shutdown = trigger.make_shutdown();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let handle = tokio::spawn(async move {
      started_tx.send(()).unwrap();
      shutdown.cancelled().await;
    });

    started_rx.await.unwrap();
    trigger.shutdown().await;
    handle.await.unwrap();
  }
}
