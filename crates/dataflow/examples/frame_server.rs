//! Publish synthetic frames into a node until SIGINT.
//!
//! Usage: frame_server [node]

use anyhow::{Context, Result};
use common::{setup_logging, shutdown_flag, Environment};
use dataflow::{ColorSpace, FrameParams, PixelType, SharedFrame, Sink};
use std::sync::atomic::Ordering;
use std::time::Duration;

const PERIOD: Duration = Duration::from_millis(33);

fn main() -> Result<()> {
    setup_logging(Environment::from_env());
    let shutdown = shutdown_flag().context("Failed to register signal handlers")?;

    let node = std::env::args().nth(1).unwrap_or_else(|| "frames".to_string());
    let params = FrameParams::new(
        480,
        640,
        PixelType::U8C1,
        ColorSpace::Grey,
        PERIOD.as_secs_f64(),
    );

    let mut sink = Sink::<SharedFrame>::bind(&node, params)
        .with_context(|| format!("Failed to bind node {node}"))?;
    tracing::info!(%node, "serving frames; ctrl-c to stop");

    while !shutdown.load(Ordering::Relaxed) {
        let frame = sink.wait()?;

        // A gradient that scrolls one row per sample.
        let phase = frame.sample_count() as u32;
        let cols = frame.cols();
        for (i, px) in frame.pixels_mut().iter_mut().enumerate() {
            *px = ((i as u32 / cols + phase) % 256) as u8;
        }

        let sample = sink.post()?;
        if sample % 300 == 0 {
            tracing::info!(sample, consumers = sink.source_count(), "streaming");
        }
        std::thread::sleep(PERIOD);
    }

    tracing::info!(published = sink.sample_number(), "stopping");
    Ok(())
}
