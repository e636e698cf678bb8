//! Asynchronous decoupler between two nodes.
//!
//! A `Buffer` converts the strict source-to-sink handshake into a bounded
//! ring: the push side drains an upstream node at the producer's pace,
//! cloning each sample into the ring, while a pop thread feeds a
//! downstream node at its consumers' pace. When the ring is full the
//! oldest sample is dropped and counted; drops are reported, never
//! silent.

use crate::errors::NodeError;
use crate::names::NodeConfig;
use crate::node::{AttachPolicy, NodeState};
use crate::payload::Payload;
use crate::sink::Sink;
use crate::source::Source;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Pop-thread poll ceiling, so shutdown is observed promptly even when no
/// sample ever arrives to wake the condition variable.
const POP_POLL: Duration = Duration::from_millis(10);

struct Shared<O> {
    ring: ArrayQueue<O>,
    gate: Mutex<()>,
    available: Condvar,
    shutdown: AtomicBool,
    dropped: AtomicU64,
}

/// Counters for one buffer run. `pushed == popped + dropped` over any
/// completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
}

pub struct Buffer<T: Payload + 'static> {
    source: Source<T>,
    shared: Arc<Shared<T::Owned>>,
    pop_thread: Option<JoinHandle<Result<u64, NodeError>>>,
    pushed: u64,
}

impl<T: Payload + 'static> Buffer<T> {
    /// Wire up `source_name -> ring -> sink_name` with environment-default
    /// configuration.
    pub fn connect(
        source_name: &str,
        sink_name: &str,
        capacity: usize,
    ) -> Result<Self, NodeError> {
        Self::connect_with(&NodeConfig::from_env(), source_name, sink_name, capacity)
    }

    /// Attach upstream, wait for its sink, and bind the downstream node
    /// with the same payload parameters. Spawns the pop thread.
    pub fn connect_with(
        cfg: &NodeConfig,
        source_name: &str,
        sink_name: &str,
        capacity: usize,
    ) -> Result<Self, NodeError> {
        let mut source = Source::touch_with(cfg, source_name)?;
        if source.connect()? == NodeState::End {
            return Err(NodeError::EndOfStream);
        }
        let params = *source.parameters()?;

        let sink = Sink::<T>::bind_with(cfg, sink_name, params, AttachPolicy::Dynamic)?;

        let shared = Arc::new(Shared {
            ring: ArrayQueue::new(capacity),
            gate: Mutex::new(()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        let pop_shared = Arc::clone(&shared);
        let pop_thread = std::thread::Builder::new()
            .name(format!("buffer-pop-{sink_name}"))
            .spawn(move || pop_loop(sink, pop_shared))?;

        Ok(Self {
            source,
            shared,
            pop_thread: Some(pop_thread),
            pushed: 0,
        })
    }

    /// Relay one sample from upstream into the ring. Returns `true` when
    /// the upstream sink has declared END.
    pub fn push(&mut self) -> Result<bool, NodeError> {
        if self.source.wait()? == NodeState::End {
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.available.notify_all();
            return Ok(true);
        }

        let sample = self.source.to_owned()?;
        self.source.post()?;

        if self.shared.ring.force_push(sample).is_some() {
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped, "buffer overrun, dropped oldest sample");
        }
        self.pushed += 1;
        self.shared.available.notify_one();

        Ok(false)
    }

    /// Drive the push side until upstream END or `quit`, then drain and
    /// propagate END downstream.
    pub fn run(mut self, quit: &AtomicBool) -> Result<BufferStats, NodeError> {
        while !quit.load(Ordering::Relaxed) {
            if self.push()? {
                break;
            }
        }
        self.finish()
    }

    /// Stop pushing, let the pop thread drain the ring, and end the
    /// downstream stream.
    pub fn finish(mut self) -> Result<BufferStats, NodeError> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();

        let popped = match self.pop_thread.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result?,
                Err(_) => {
                    tracing::error!("buffer pop thread panicked");
                    0
                }
            },
            None => 0,
        };

        Ok(BufferStats {
            pushed: self.pushed,
            popped,
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        })
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed(&self) -> u64 {
        self.pushed
    }
}

impl<T: Payload + 'static> Drop for Buffer<T> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        if let Some(handle) = self.pop_thread.take() {
            let _ = handle.join();
        }
    }
}

fn pop_loop<T: Payload>(
    mut sink: Sink<T>,
    shared: Arc<Shared<T::Owned>>,
) -> Result<u64, NodeError> {
    let mut popped = 0u64;

    loop {
        if shared.ring.is_empty() {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            let guard = shared
                .gate
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let _ = shared
                .available
                .wait_timeout(guard, POP_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        }

        // Take the downstream critical section before dequeuing so a
        // stalled consumer backs pressure up into the ring, not into a
        // sample held in limbo.
        let payload = sink.wait()?;
        if let Some(sample) = shared.ring.pop() {
            payload.copy_from_owned(&sample);
            sink.post_unstamped()?;
            popped += 1;
        }
    }

    // Dropping the sink here declares END downstream.
    Ok(popped)
}
