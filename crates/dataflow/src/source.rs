use crate::errors::NodeError;
use crate::names::NodeConfig;
use crate::node::{Node, NodeState, SourceSlot};
use crate::payload::Payload;

/// Consumer endpoint of a node.
///
/// Life cycle: `touch` reserves a slot (creating the segment if the sink
/// has not arrived yet), `connect` blocks until the sink binds and builds
/// the typed view, then the drive loop is
/// `while wait()? == Live { retrieve()/to_owned(); post(); }`.
///
/// A source pulls at the sink's pace: not calling `wait` in time stalls
/// the producer. Put a [`crate::Buffer`] behind a source that needs
/// decoupling.
pub struct Source<T: Payload> {
    node: Node,
    slot: SourceSlot,
    payload: Option<T>,
    params: Option<T::Params>,
    last_seen: u64,
    in_sample: bool,
    ended: bool,
    dead: bool,
}

impl<T: Payload> Source<T> {
    /// Attach to the named node with environment-default configuration.
    pub fn touch(name: &str) -> Result<Self, NodeError> {
        Self::touch_with(&NodeConfig::from_env(), name)
    }

    pub fn touch_with(cfg: &NodeConfig, name: &str) -> Result<Self, NodeError> {
        let mut node = Node::open(cfg, name)?;
        let slot = node.attach_source()?;

        Ok(Self {
            node,
            slot,
            payload: None,
            params: None,
            last_seen: slot.joined_at,
            in_sample: false,
            ended: false,
            dead: false,
        })
    }

    /// Block until the node is bound (or the stream is already over),
    /// then build the typed view over the payload region.
    pub fn connect(&mut self) -> Result<NodeState, NodeError> {
        let state = common::wait_for_resource(
            || self.node.bound_state(),
            1,
            &format!("node {} sink", self.node.name()),
        );

        if state == NodeState::End {
            self.ended = true;
            return Ok(NodeState::End);
        }

        let block = self.node.params_block();
        let params = T::decode_params(&block)?;
        self.node.map_payload(T::required_bytes(&params))?;
        self.payload = Some(unsafe { T::attach(self.node.payload_ptr(), &params) });
        self.params = Some(params);

        Ok(NodeState::Live)
    }

    /// Payload parameters declared by the sink. Available after a
    /// successful [`Source::connect`].
    pub fn parameters(&self) -> Result<&T::Params, NodeError> {
        self.params
            .as_ref()
            .ok_or_else(|| NodeError::NotBound(self.node.name().to_string()))
    }

    /// Block until the sink publishes the next sample or declares END.
    /// On `Live`, the source holds its critical section until `post()`.
    pub fn wait(&mut self) -> Result<NodeState, NodeError> {
        if self.dead {
            return Err(NodeError::SlotReclaimed);
        }
        if self.ended {
            return Ok(NodeState::End);
        }
        if self.payload.is_none() {
            return Err(NodeError::NotBound(self.node.name().to_string()));
        }

        match self.node.consume_begin(&self.slot, &mut self.last_seen) {
            Ok(NodeState::Live) => {
                self.in_sample = true;
                Ok(NodeState::Live)
            }
            Ok(NodeState::End) => {
                self.ended = true;
                Ok(NodeState::End)
            }
            Err(NodeError::SlotReclaimed) => {
                self.dead = true;
                Err(NodeError::SlotReclaimed)
            }
            Err(e) => Err(e),
        }
    }

    /// Borrow the shared payload. Valid only inside the critical section,
    /// i.e. after `wait()` returned `Live` and before `post()`.
    pub fn retrieve(&self) -> Result<&T, NodeError> {
        if !self.in_sample {
            return Err(NodeError::NoSample);
        }
        match &self.payload {
            Some(payload) => Ok(payload),
            None => Err(NodeError::NotBound(self.node.name().to_string())),
        }
    }

    /// Deep-copy the held sample out of shared memory.
    pub fn to_owned(&self) -> Result<T::Owned, NodeError> {
        Ok(self.retrieve()?.to_owned())
    }

    /// Deep-copy the held sample into an existing owned value.
    pub fn copy_to(&self, dst: &mut T::Owned) -> Result<(), NodeError> {
        self.retrieve()?.copy_to(dst);
        Ok(())
    }

    /// Leave the critical section, releasing the sample back to the sink.
    pub fn post(&mut self) -> Result<(), NodeError> {
        if self.dead {
            return Err(NodeError::SlotReclaimed);
        }
        if self.ended {
            return Ok(());
        }
        if !self.in_sample {
            return Err(NodeError::NoSample);
        }

        match self.node.consume_end(&self.slot, self.last_seen) {
            Ok(()) => {
                self.in_sample = false;
                Ok(())
            }
            Err(NodeError::SlotReclaimed) => {
                self.dead = true;
                self.in_sample = false;
                Err(NodeError::SlotReclaimed)
            }
            Err(e) => Err(e),
        }
    }

    /// Sample number of the most recently observed sample.
    pub fn sample_number(&self) -> u64 {
        self.last_seen
    }
}

impl<T: Payload> Drop for Source<T> {
    fn drop(&mut self) {
        if self.dead {
            return;
        }
        if self.in_sample {
            if let Err(e) = self.node.consume_end(&self.slot, self.last_seen) {
                tracing::debug!(node = self.node.name(), "release on drop failed: {e}");
            }
        }
        if let Err(e) = self.node.detach_source(&self.slot) {
            tracing::debug!(node = self.node.name(), "detach on drop failed: {e}");
        }
    }
}
