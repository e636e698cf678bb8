use crate::errors::NodeError;

pub use crate::header::PARAMS_BYTES;

/// A typed, in-place view over a node's payload region.
///
/// Implementations are descriptor-driven: a fixed-size `Params` value is
/// encoded into the node header's 128-byte descriptor block at bind time,
/// decoded by every connecting source, and used to construct a matching
/// view over the same payload bytes in each process. Views are
/// constructed over fixed offsets, never deserialized, so the pixel (or
/// struct) bytes cross process boundaries without a copy.
///
/// All dynamic extent must live at offsets derived from `Params`; a view
/// must not hold pointers into process-local memory.
pub trait Payload: Send {
    /// Fixed-size descriptor negotiated through the node header.
    type Params: Copy + Send + 'static;

    /// Process-local deep copy, safe to hold outside the critical section.
    type Owned: Send + 'static;

    fn encode_params(params: &Self::Params, dst: &mut [u8; PARAMS_BYTES]);

    fn decode_params(src: &[u8; PARAMS_BYTES]) -> Result<Self::Params, NodeError>;

    /// Bytes of payload region this descriptor requires.
    fn required_bytes(params: &Self::Params) -> usize;

    /// Construct the view.
    ///
    /// # Safety
    ///
    /// `region` must point at a mapped run of at least
    /// `required_bytes(params)` bytes, 64-byte aligned, that outlives the
    /// view. Access to the bytes must follow the node protocol: the sink
    /// mutates only inside its critical section, sources read only inside
    /// theirs.
    unsafe fn attach(region: *mut u8, params: &Self::Params) -> Self;

    /// Record the sample number and wall-clock timestamp of a publish.
    fn stamp(&mut self, sample_number: u64, timestamp_ns: u64);

    fn to_owned(&self) -> Self::Owned;

    /// Deep copy into an existing owned value, reusing its allocation.
    fn copy_to(&self, dst: &mut Self::Owned);

    /// Overwrite the shared payload from an owned value, stamp included.
    fn copy_from_owned(&mut self, src: &Self::Owned);
}
