// surge - bitdrift's ingress QPS autoscaler
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use clap::Parser;
use log::info;
use surge_common::global_initialize;
use surge_scaler::{Options, run_server};
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};

fn main() -> anyhow::Result<()> {
  global_initialize();
  let options = Options::parse();

  let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
  runtime.block_on(run_server(options, async {
    // Trap ctrl+c and sigterm and perform a clean shutdown.
    let mut sigint = signal(SignalKind::interrupt()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();
    select! {
      _ = sigint.recv() => info!("received sigint"),
      _ = sigterm.recv() => info!("received sigterm"),
    }
  }))
}
