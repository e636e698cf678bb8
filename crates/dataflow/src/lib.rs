//! Single-producer / multi-consumer shared-memory dataflow nodes.
//!
//! Processes rendezvous on named nodes: one [`Sink`] publishes typed
//! samples into a shared segment, up to `max_sources` [`Source`]s observe
//! every sample exactly once before the sink may overwrite it, and
//! [`Buffer`] decouples a pair of nodes through a bounded ring. Payload
//! bytes never cross process boundaries through a user-space copy.

pub mod buffer;
pub mod errors;
pub mod frame;
pub mod names;
pub mod payload;
pub mod pose;
pub mod semaphore;
pub mod sink;
pub mod source;

mod header;
mod node;
mod segment;

pub use buffer::{Buffer, BufferStats};
pub use errors::NodeError;
pub use frame::{ColorSpace, FrameBuf, FrameParams, PixelType, SharedFrame};
pub use names::NodeConfig;
pub use node::{AttachPolicy, NodeState};
pub use payload::Payload;
pub use pose::{CoordSystem, Pose, PoseParams, SharedPose};
pub use semaphore::SemaphoreError;
pub use sink::Sink;
pub use source::Source;
