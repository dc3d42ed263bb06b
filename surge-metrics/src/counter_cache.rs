// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./counter_cache_test.rs"]
mod counter_cache_test;

use crate::parser::{self, IndexFn, canonical_index};
use crate::ring::Ring;
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use prometheus::IntCounter;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

//
// Ticker
//

// The tick source is abstracted so tests can drive scrapes deterministically.
#[async_trait]
pub trait Ticker: Send {
  async fn next(&mut self);
}

// An interval is used over a sleep so a slow endpoint does not stretch the effective scrape
// period.
#[async_trait]
impl Ticker for tokio::time::Interval {
  async fn next(&mut self) {
    self.tick().await;
  }
}

pub type TickerFactory = Box<dyn Fn() -> Box<dyn Ticker> + Send + Sync>;

#[must_use]
pub fn interval_ticker_factory(interval: Duration) -> TickerFactory {
  Box::new(move || {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Box::new(ticker) as Box<dyn Ticker>
  })
}

//
// Stats
//

struct Stats {
  scrape_attempt: IntCounter,
  scrape_failure: IntCounter,
  scrape_complete: IntCounter,
  parse_failure: IntCounter,
}

impl Default for Stats {
  fn default() -> Self {
    Self {
      scrape_attempt: IntCounter::new("scrape_attempt", "Scrapes attempted").unwrap(),
      scrape_failure: IntCounter::new("scrape_failure", "Scrapes that failed").unwrap(),
      scrape_complete: IntCounter::new("scrape_complete", "Scrapes completed").unwrap(),
      parse_failure: IntCounter::new("parse_failure", "Scrape bodies that failed to parse").unwrap(),
    }
  }
}

//
// CounterCache
//

/// A rolling window of per-series sample sums for one metric family, fed by periodically
/// scraping every endpoint in the current set.
///
/// Each tick scrapes all endpoints, sums the values of same-indexed samples across the endpoints
/// that responded, and appends one sum per series to that series' ring. Endpoints that fail are
/// skipped for the tick. The endpoint set is replaced by snapshots from the updates channel and
/// the run loop exits when that channel closes.
///
/// A single reader-writer lock guards the series map and the rings in it: the run loop is the
/// only writer, RPC readers share read access.
pub struct CounterCache {
  metric_name: String,
  interval: Duration,
  window: Duration,
  capacity: usize,
  client: reqwest::Client,
  stats: Stats,
  index_fn: Box<IndexFn>,
  ticker_factory: TickerFactory,
  updates_rx: Mutex<Option<mpsc::Receiver<Vec<String>>>>,
  rings: RwLock<HashMap<String, Ring<f64>>>,
}

impl CounterCache {
  #[must_use]
  pub fn new(
    metric_name: &str,
    interval: Duration,
    window: Duration,
    scrape_timeout: Duration,
    updates_rx: mpsc::Receiver<Vec<String>>,
  ) -> Self {
    Self::with_ticker_factory(
      metric_name,
      interval,
      window,
      scrape_timeout,
      updates_rx,
      interval_ticker_factory(interval),
    )
  }

  #[must_use]
  pub fn with_ticker_factory(
    metric_name: &str,
    interval: Duration,
    window: Duration,
    scrape_timeout: Duration,
    updates_rx: mpsc::Receiver<Vec<String>>,
    ticker_factory: TickerFactory,
  ) -> Self {
    assert!(!interval.is_zero(), "scrape interval must be non-zero");
    assert!(window >= interval, "window must be at least one interval");
    if window.as_nanos() % interval.as_nanos() != 0 {
      log::warn!("window {window:?} should be a multiple of interval {interval:?}");
    }

    // One slot more than the number of whole intervals in the window, so that both endpoints of
    // a window-length lookback are retained.
    #[allow(clippy::cast_possible_truncation)]
    let capacity = (window.as_nanos() / interval.as_nanos()) as usize + 1;

    Self {
      metric_name: metric_name.to_string(),
      interval,
      window,
      capacity,
      client: reqwest::Client::builder()
        .timeout(scrape_timeout)
        .build()
        .expect("failed to build scrape client"),
      stats: Stats::default(),
      index_fn: Box::new(canonical_index),
      ticker_factory,
      updates_rx: Mutex::new(Some(updates_rx)),
      rings: RwLock::new(HashMap::new()),
    }
  }

  /// Replaces the series index function. Must be called before `run`.
  pub fn set_index_fn(&mut self, index_fn: Box<IndexFn>) {
    self.index_fn = index_fn;
  }

  /// The scrape and update loop. Returns when the updates channel closes.
  pub async fn run(self: Arc<Self>) {
    let mut updates_rx = self
      .updates_rx
      .lock()
      .take()
      .expect("run may only be called once");
    let mut ticker = (self.ticker_factory)();
    let mut addrs: Vec<String> = Vec::new();

    log::info!(
      "starting counter cache for '{}' with interval {:?} and window {:?}",
      self.metric_name,
      self.interval,
      self.window
    );
    loop {
      // A pending endpoint update is applied before a pending tick so a tick never scrapes a
      // set that is known to be stale.
      tokio::select! {
        biased;
        update = updates_rx.recv() => match update {
          Some(new_addrs) => {
            log::debug!("('{}') updating endpoints to: {new_addrs:?}", self.metric_name);
            addrs = new_addrs;
          },
          None => {
            log::info!("('{}') endpoint updates channel closed, stopping", self.metric_name);
            return;
          },
        },
        () = ticker.next() => self.tick(&addrs).await,
      }
    }
  }

  // One scrape pass over the current endpoint set. All scrapes complete before any ring write,
  // so readers observe either the pre-tick or the post-tick state.
  async fn tick(&self, addrs: &[String]) {
    let mut totals: HashMap<String, f64> = HashMap::new();
    for addr in addrs {
      log::debug!("fetching metrics from {addr}");
      let Some(samples) = self.scrape(addr).await else {
        continue;
      };
      for (index, value) in samples {
        *totals.entry(index).or_insert(0.0) += value;
      }
    }

    if totals.is_empty() {
      return;
    }

    let mut rings = self.rings.write();
    for (index, sum) in totals {
      rings
        .entry(index)
        .or_insert_with(|| Ring::new(self.capacity))
        .enqueue(sum);
    }
  }

  async fn scrape(&self, addr: &str) -> Option<HashMap<String, f64>> {
    self.stats.scrape_attempt.inc();
    let body = match self.fetch(addr).await {
      Ok(body) => body,
      Err(e) => {
        log::warn!("failed to scrape {addr}: {e}");
        self.stats.scrape_failure.inc();
        return None;
      },
    };

    match parser::extract_samples(&body, &self.metric_name, self.index_fn.as_ref()) {
      Ok(samples) => {
        self.stats.scrape_complete.inc();
        Some(samples)
      },
      Err(e) => {
        log::warn!("failed to parse response from {addr}: {e}");
        self.stats.parse_failure.inc();
        None
      },
    }
  }

  async fn fetch(&self, addr: &str) -> anyhow::Result<String> {
    let response = self.client.get(addr).header(ACCEPT, "text/plain").send().await?;
    let status = response.status();
    if status != StatusCode::OK {
      bail!("got {status} response");
    }
    Ok(response.text().await?)
  }

  #[allow(clippy::cast_possible_truncation)]
  fn steps(&self, duration: Duration) -> u64 {
    (duration.as_nanos() / self.interval.as_nanos()) as u64
  }

  /// The latest sum enqueued for `index`.
  pub fn latest(&self, index: &str) -> anyhow::Result<f64> {
    let rings = self.rings.read();
    let Some(ring) = rings.get(index) else {
      bail!("series '{index}' not found");
    };
    Ok(*ring.latest())
  }

  /// The sum enqueued `⌊duration / interval⌋` ticks before the latest one. Fails when the
  /// duration exceeds the retained window, the series is unknown, or not enough ticks have
  /// accumulated yet.
  pub fn before(&self, index: &str, duration: Duration) -> anyhow::Result<f64> {
    if duration > self.window {
      bail!("duration {duration:?} is greater than window {:?}", self.window);
    }
    if duration.as_nanos() % self.interval.as_nanos() != 0 {
      log::warn!(
        "duration {duration:?} is not a multiple of interval {:?}, flooring",
        self.interval
      );
    }

    let steps = self.steps(duration);
    let rings = self.rings.read();
    let Some(ring) = rings.get(index) else {
      bail!("series '{index}' not found");
    };
    if ring.count() <= steps {
      bail!(
        "series '{index}' has {} samples, need at least {}",
        ring.count(),
        steps + 1
      );
    }
    #[allow(clippy::cast_possible_truncation)]
    let position = steps as usize;
    Ok(*ring.before(position))
  }

  /// Whether enough history exists to compute a rate over `duration`: strictly more enqueues
  /// than the number of whole intervals in the lookback.
  #[must_use]
  pub fn active(&self, index: &str, duration: Duration) -> bool {
    let steps = self.steps(duration);
    self
      .rings
      .read()
      .get(index)
      .is_some_and(|ring| ring.count() > steps)
  }
}
