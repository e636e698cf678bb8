//! Consume frames from a node until the server leaves or SIGINT.
//!
//! Usage: frame_client [node]

use anyhow::{Context, Result};
use common::{setup_logging, shutdown_flag, Environment};
use dataflow::{NodeState, SharedFrame, Source};
use std::sync::atomic::Ordering;

fn main() -> Result<()> {
    setup_logging(Environment::from_env());
    let shutdown = shutdown_flag().context("Failed to register signal handlers")?;

    let node = std::env::args().nth(1).unwrap_or_else(|| "frames".to_string());

    let mut source = Source::<SharedFrame>::touch(&node)
        .with_context(|| format!("Failed to attach to node {node}"))?;

    if source.connect()? == NodeState::End {
        tracing::warn!(%node, "stream was already over");
        return Ok(());
    }
    let params = *source.parameters()?;
    tracing::info!(
        %node,
        rows = params.rows,
        cols = params.cols,
        "connected"
    );

    let mut frames = 0u64;
    while !shutdown.load(Ordering::Relaxed) {
        if source.wait()? == NodeState::End {
            break;
        }

        let frame = source.to_owned()?;
        source.post()?;

        frames += 1;
        if frames % 300 == 0 {
            tracing::info!(
                sample = frame.sample_count(),
                first_pixel = frame.pixels()[0],
                "consuming"
            );
        }
    }

    tracing::info!(frames, "done");
    Ok(())
}
