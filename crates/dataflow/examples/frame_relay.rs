//! Decouple two nodes through a bounded ring.
//!
//! Usage: frame_relay [source_node] [sink_node] [capacity]

use anyhow::{Context, Result};
use common::{setup_logging, shutdown_flag, Environment};
use dataflow::{Buffer, SharedFrame};

fn main() -> Result<()> {
    setup_logging(Environment::from_env());
    let shutdown = shutdown_flag().context("Failed to register signal handlers")?;

    let mut args = std::env::args().skip(1);
    let source_node = args.next().unwrap_or_else(|| "frames".to_string());
    let sink_node = args.next().unwrap_or_else(|| "frames_buffered".to_string());
    let capacity = args.next().and_then(|s| s.parse().ok()).unwrap_or(64);

    let buffer = Buffer::<SharedFrame>::connect(&source_node, &sink_node, capacity)
        .with_context(|| format!("Failed to relay {source_node} -> {sink_node}"))?;
    tracing::info!(%source_node, %sink_node, capacity, "relaying");

    let stats = buffer.run(&shutdown)?;
    tracing::info!(
        pushed = stats.pushed,
        popped = stats.popped,
        dropped = stats.dropped,
        "relay finished"
    );
    Ok(())
}
