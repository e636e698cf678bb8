//! Pose payload: a fixed-size POD describing a tracked object.
//!
//! The whole value lives inside the node's payload region with no external
//! allocation, so the shared view is the struct in place and a clone is a
//! plain copy.

use crate::errors::NodeError;
use crate::payload::{Payload, PARAMS_BYTES};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordSystem {
    /// Image coordinates in pixels.
    Pixels = 0,
    /// World coordinates, reached through the carried homography.
    World = 1,
}

pub const REGION_LABEL_BYTES: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub sample_count: u64,
    pub timestamp_ns: u64,
    pub coord_system: CoordSystem,
    pub found: bool,
    pub position_valid: bool,
    pub velocity_valid: bool,
    pub heading_valid: bool,
    pub homography_valid: bool,
    pub region_valid: bool,
    region: [u8; REGION_LABEL_BYTES],
    pub position: [f64; 2],
    pub velocity: [f64; 2],
    pub heading: [f64; 2],
    pub homography: [[f64; 3]; 3],
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            sample_count: 0,
            timestamp_ns: 0,
            coord_system: CoordSystem::Pixels,
            found: false,
            position_valid: false,
            velocity_valid: false,
            heading_valid: false,
            homography_valid: false,
            region_valid: false,
            region: [0; REGION_LABEL_BYTES],
            position: [0.0; 2],
            velocity: [0.0; 2],
            heading: [0.0; 2],
            homography: [[0.0; 3]; 3],
        }
    }
}

impl Pose {
    /// Region label, truncated to what fits the fixed field.
    pub fn set_region(&mut self, label: &str) {
        self.region = [0; REGION_LABEL_BYTES];
        let take = label.len().min(REGION_LABEL_BYTES);
        self.region[..take].copy_from_slice(&label.as_bytes()[..take]);
        self.region_valid = true;
    }

    pub fn region(&self) -> &str {
        let end = self
            .region
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(REGION_LABEL_BYTES);
        std::str::from_utf8(&self.region[..end]).unwrap_or("")
    }
}

/// Pacing metadata for a pose stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseParams {
    pub sample_period_sec: f64,
}

/// In-place pose view over a node's payload region.
pub struct SharedPose {
    pose: *mut Pose,
}

unsafe impl Send for SharedPose {}

impl Deref for SharedPose {
    type Target = Pose;

    fn deref(&self) -> &Pose {
        unsafe { &*self.pose }
    }
}

impl DerefMut for SharedPose {
    fn deref_mut(&mut self) -> &mut Pose {
        unsafe { &mut *self.pose }
    }
}

impl Payload for SharedPose {
    type Params = PoseParams;
    type Owned = Pose;

    fn encode_params(params: &PoseParams, dst: &mut [u8; PARAMS_BYTES]) {
        dst[..8].copy_from_slice(&params.sample_period_sec.to_le_bytes());
    }

    fn decode_params(src: &[u8; PARAMS_BYTES]) -> Result<PoseParams, NodeError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&src[..8]);
        let sample_period_sec = f64::from_le_bytes(bytes);
        if !sample_period_sec.is_finite() || sample_period_sec < 0.0 {
            return Err(NodeError::BadParams("bad sample period"));
        }
        Ok(PoseParams { sample_period_sec })
    }

    fn required_bytes(_params: &PoseParams) -> usize {
        std::mem::size_of::<Pose>()
    }

    unsafe fn attach(region: *mut u8, _params: &PoseParams) -> Self {
        Self {
            pose: region as *mut Pose,
        }
    }

    fn stamp(&mut self, sample_number: u64, timestamp_ns: u64) {
        self.sample_count = sample_number;
        self.timestamp_ns = timestamp_ns;
    }

    fn to_owned(&self) -> Pose {
        unsafe { *self.pose }
    }

    fn copy_to(&self, dst: &mut Pose) {
        *dst = unsafe { *self.pose };
    }

    fn copy_from_owned(&mut self, src: &Pose) {
        unsafe { *self.pose = *src };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pose_reports_nothing() {
        let pose = Pose::default();
        assert!(!pose.found);
        assert!(!pose.position_valid);
        assert_eq!(pose.region(), "");
    }

    #[test]
    fn test_region_label_truncates() {
        let mut pose = Pose::default();
        pose.set_region("arena_northwest_quadrant");

        assert!(pose.region_valid);
        assert_eq!(pose.region(), "arena_northwest_");
    }

    #[repr(C, align(64))]
    struct AlignedRegion([u8; std::mem::size_of::<Pose>()]);

    #[test]
    fn test_shared_view_round_trip() {
        let mut region = AlignedRegion([0u8; std::mem::size_of::<Pose>()]);
        let mut shared = unsafe {
            SharedPose::attach(
                region.0.as_mut_ptr(),
                &PoseParams {
                    sample_period_sec: 0.01,
                },
            )
        };

        let mut pose = Pose::default();
        pose.found = true;
        pose.position_valid = true;
        pose.position = [12.5, -3.0];
        pose.set_region("arena");
        shared.copy_from_owned(&pose);
        shared.stamp(42, 1_000);

        assert!(shared.found);
        assert_eq!(shared.sample_count, 42);
        assert_eq!(shared.position, [12.5, -3.0]);

        let cloned = shared.to_owned();
        assert_eq!(cloned.region(), "arena");
        assert_eq!(cloned.timestamp_ns, 1_000);
    }
}
