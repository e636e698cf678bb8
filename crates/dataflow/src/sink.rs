use crate::errors::NodeError;
use crate::header::PARAMS_BYTES;
use crate::names::NodeConfig;
use crate::node::{AttachPolicy, Node};
use crate::payload::Payload;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Producer endpoint of a node.
///
/// At most one sink binds a node at a time. The payload lives in place in
/// the shared segment; `wait()` hands out a mutable reference that is only
/// valid until the matching `post()`, which is when consumers are let in.
pub struct Sink<T: Payload> {
    node: Node,
    payload: T,
    params: T::Params,
    /// Write-barrier counts still owed for the previous sample.
    outstanding: u32,
    ended: bool,
}

impl<T: Payload> Sink<T> {
    /// Bind the named node with environment-default configuration and
    /// dynamic membership.
    pub fn bind(name: &str, params: T::Params) -> Result<Self, NodeError> {
        Self::bind_with(&NodeConfig::from_env(), name, params, AttachPolicy::Dynamic)
    }

    pub fn bind_with(
        cfg: &NodeConfig,
        name: &str,
        params: T::Params,
        policy: AttachPolicy,
    ) -> Result<Self, NodeError> {
        let mut node = Node::open(cfg, name)?;

        let payload_bytes = T::required_bytes(&params);
        let mut block = [0u8; PARAMS_BYTES];
        T::encode_params(&params, &mut block);
        node.bind_as_sink(payload_bytes as u64, &block, policy)?;

        let payload = unsafe { T::attach(node.payload_ptr(), &params) };

        Ok(Self {
            node,
            payload,
            params,
            outstanding: 0,
            ended: false,
        })
    }

    /// Enter the critical section: blocks until every source has released
    /// the previous sample, then hands out the in-place payload for
    /// mutation.
    pub fn wait(&mut self) -> Result<&mut T, NodeError> {
        if self.ended {
            return Err(NodeError::EndOfStream);
        }
        self.node.publish_begin(&mut self.outstanding, None)?;
        Ok(&mut self.payload)
    }

    /// Like [`Sink::wait`], giving up after `timeout`. Returns `None` on
    /// timeout; pair with [`Sink::reclaim_stalled`] to evict dead
    /// consumers.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<&mut T>, NodeError> {
        if self.ended {
            return Err(NodeError::EndOfStream);
        }
        if self.node.publish_begin(&mut self.outstanding, Some(timeout))? {
            Ok(Some(&mut self.payload))
        } else {
            Ok(None)
        }
    }

    /// Publish the payload as the next sample: stamps it with the new
    /// sample number and wall clock, then opens the consumers' gates.
    pub fn post(&mut self) -> Result<u64, NodeError> {
        if self.ended {
            return Err(NodeError::EndOfStream);
        }
        let next = self.node.sample_number() + 1;
        self.payload.stamp(next, wall_clock_ns());
        self.finish_post()
    }

    /// Publish without touching the payload's own stamp. Used when
    /// relaying samples whose stamp must survive, e.g. through a buffer.
    pub fn post_unstamped(&mut self) -> Result<u64, NodeError> {
        if self.ended {
            return Err(NodeError::EndOfStream);
        }
        self.finish_post()
    }

    fn finish_post(&mut self) -> Result<u64, NodeError> {
        let (sample, posted) = self.node.publish_end()?;
        self.outstanding = posted;
        Ok(sample)
    }

    /// Evict attached sources that have not released the current sample.
    /// Call after [`Sink::wait_timeout`] returned `None`.
    pub fn reclaim_stalled(&mut self) -> Result<u32, NodeError> {
        self.node.reclaim_stalled(&mut self.outstanding)
    }

    pub fn parameters(&self) -> &T::Params {
        &self.params
    }

    pub fn sample_number(&self) -> u64 {
        self.node.sample_number()
    }

    pub fn source_count(&self) -> u32 {
        self.node.source_count()
    }

    /// Declare END. Every source's pending or next wait observes it; the
    /// segment is removed once the last of them detaches.
    pub fn end(&mut self) -> Result<(), NodeError> {
        if self.ended {
            return Ok(());
        }
        self.node.end_stream()?;
        self.ended = true;
        Ok(())
    }
}

impl<T: Payload> Drop for Sink<T> {
    fn drop(&mut self) {
        if let Err(e) = self.end() {
            tracing::debug!(node = self.node.name(), "end on drop failed: {e}");
        }
        self.node.cleanup_if_drained();
    }
}
