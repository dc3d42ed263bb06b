// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./parser_test.rs"]
mod parser_test;

use prometheus_parser::{GroupKind, ParserError};
use std::collections::{BTreeMap, HashMap};

pub const METRIC_NAME_LABEL: &str = "__name__";

/// Maps a sample's label set (including the reserved `__name__` label) to the string the series
/// is stored under.
pub type IndexFn = dyn Fn(&BTreeMap<String, String>) -> String + Send + Sync;

/// The default series index: the canonical string of the full label set, e.g.
/// `name{a="1",b="2"}`.
#[must_use]
pub fn canonical_index(labels: &BTreeMap<String, String>) -> String {
  let name = labels.get(METRIC_NAME_LABEL).map_or("", String::as_str);
  let rest = labels
    .iter()
    .filter(|(label, _)| *label != METRIC_NAME_LABEL)
    .map(|(label, value)| format!("{label}={value:?}"))
    .collect::<Vec<_>>()
    .join(",");
  if rest.is_empty() {
    name.to_string()
  } else {
    format!("{name}{{{rest}}}")
  }
}

/// Parses a text exposition body and extracts `series index -> value` for the single metric
/// family named `metric_name`. Counter, gauge, and untyped samples contribute their value;
/// histogram and summary families are ignored. Within one body the last sample per index wins.
pub fn extract_samples(
  body: &str,
  metric_name: &str,
  index_fn: &IndexFn,
) -> Result<HashMap<String, f64>, ParserError> {
  let mut samples = HashMap::new();
  for group in prometheus_parser::parse_text(body)? {
    if group.name != metric_name {
      continue;
    }

    let metrics = match group.metrics {
      GroupKind::Counter(metrics) | GroupKind::Gauge(metrics) | GroupKind::Untyped(metrics) => {
        metrics
      },
      GroupKind::Histogram(_) | GroupKind::Summary(_) => continue,
    };

    for (key, metric) in metrics {
      let mut labels = key.labels.clone();
      labels.insert(METRIC_NAME_LABEL.to_string(), metric_name.to_string());
      samples.insert(index_fn(&labels), metric.value);
    }
  }

  Ok(samples)
}
