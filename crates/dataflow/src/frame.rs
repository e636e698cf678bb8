//! Image frame payload.
//!
//! The payload region for a frame holds a small fixed stamp (sample
//! number, wall-clock timestamp) followed by the pixel bytes at a 64-byte
//! aligned offset. Geometry and pixel format travel in the node header's
//! descriptor block, so every attached process points a view of the
//! declared shape at the same pixel run with no copy; cloning is a single
//! memcpy of `rows * stride` bytes.

use crate::errors::NodeError;
use crate::payload::{Payload, PARAMS_BYTES};
use serde::{Deserialize, Serialize};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelType {
    U8C1 = 0,
    U8C3 = 1,
    U8C4 = 2,
}

impl PixelType {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelType::U8C1 => 1,
            PixelType::U8C3 => 3,
            PixelType::U8C4 => 4,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PixelType::U8C1),
            1 => Some(PixelType::U8C3),
            2 => Some(PixelType::U8C4),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    Grey = 0,
    Bgr = 1,
    Hsv = 2,
    Rgb = 3,
}

impl ColorSpace {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ColorSpace::Grey),
            1 => Some(ColorSpace::Bgr),
            2 => Some(ColorSpace::Hsv),
            3 => Some(ColorSpace::Rgb),
            _ => None,
        }
    }
}

/// Frame geometry and pacing, declared once by the sink at bind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameParams {
    pub rows: u32,
    pub cols: u32,
    pub pixel_type: PixelType,
    pub color: ColorSpace,
    pub stride: u32,
    pub sample_period_sec: f64,
}

impl FrameParams {
    pub fn new(
        rows: u32,
        cols: u32,
        pixel_type: PixelType,
        color: ColorSpace,
        sample_period_sec: f64,
    ) -> Self {
        Self {
            rows,
            cols,
            pixel_type,
            color,
            stride: cols * pixel_type.bytes_per_pixel() as u32,
            sample_period_sec,
        }
    }

    pub fn pixel_bytes(&self) -> usize {
        self.rows as usize * self.stride as usize
    }
}

// Descriptor block offsets (little-endian):
//   rows u32 @0, cols u32 @4, pixel_type u8 @8, color u8 @9,
//   stride u32 @12, bytes_per_pixel u8 @16, sample_period_sec f64 @24
const P_ROWS: usize = 0;
const P_COLS: usize = 4;
const P_PIXEL_TYPE: usize = 8;
const P_COLOR: usize = 9;
const P_STRIDE: usize = 12;
const P_BPP: usize = 16;
const P_PERIOD: usize = 24;

/// Pixel bytes start here, leaving the stamp its own cache line.
const PIXEL_OFFSET: usize = 64;

#[repr(C)]
struct FrameStamp {
    sample_count: u64,
    timestamp_ns: u64,
}

fn read_u32(src: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&src[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_f64(src: &[u8], at: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&src[at..at + 8]);
    f64::from_le_bytes(bytes)
}

/// Zero-copy frame view over a node's payload region.
///
/// A `SharedFrame` constructed by a source is valid only while the source
/// critical section is held; use [`SharedFrame::to_owned`] to keep pixels
/// past `post()`.
pub struct SharedFrame {
    params: FrameParams,
    stamp: *mut FrameStamp,
    pixels: *mut u8,
}

unsafe impl Send for SharedFrame {}

impl SharedFrame {
    pub fn rows(&self) -> u32 {
        self.params.rows
    }

    pub fn cols(&self) -> u32 {
        self.params.cols
    }

    pub fn pixel_type(&self) -> PixelType {
        self.params.pixel_type
    }

    pub fn color(&self) -> ColorSpace {
        self.params.color
    }

    pub fn stride(&self) -> u32 {
        self.params.stride
    }

    pub fn sample_period_sec(&self) -> f64 {
        self.params.sample_period_sec
    }

    pub fn sample_count(&self) -> u64 {
        unsafe { (*self.stamp).sample_count }
    }

    pub fn timestamp_ns(&self) -> u64 {
        unsafe { (*self.stamp).timestamp_ns }
    }

    pub fn pixels(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.pixels, self.params.pixel_bytes()) }
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.pixels, self.params.pixel_bytes()) }
    }
}

/// Process-local frame: owns its pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuf {
    params: FrameParams,
    sample_count: u64,
    timestamp_ns: u64,
    pixels: Vec<u8>,
}

impl FrameBuf {
    pub fn empty(params: FrameParams) -> Self {
        Self {
            params,
            sample_count: 0,
            timestamp_ns: 0,
            pixels: vec![0; params.pixel_bytes()],
        }
    }

    pub fn params(&self) -> &FrameParams {
        &self.params
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl Payload for SharedFrame {
    type Params = FrameParams;
    type Owned = FrameBuf;

    fn encode_params(params: &FrameParams, dst: &mut [u8; PARAMS_BYTES]) {
        dst[P_ROWS..P_ROWS + 4].copy_from_slice(&params.rows.to_le_bytes());
        dst[P_COLS..P_COLS + 4].copy_from_slice(&params.cols.to_le_bytes());
        dst[P_PIXEL_TYPE] = params.pixel_type as u8;
        dst[P_COLOR] = params.color as u8;
        dst[P_STRIDE..P_STRIDE + 4].copy_from_slice(&params.stride.to_le_bytes());
        dst[P_BPP] = params.pixel_type.bytes_per_pixel() as u8;
        dst[P_PERIOD..P_PERIOD + 8].copy_from_slice(&params.sample_period_sec.to_le_bytes());
    }

    fn decode_params(src: &[u8; PARAMS_BYTES]) -> Result<FrameParams, NodeError> {
        let rows = read_u32(src, P_ROWS);
        let cols = read_u32(src, P_COLS);
        let pixel_type = PixelType::from_u8(src[P_PIXEL_TYPE])
            .ok_or(NodeError::BadParams("unknown pixel type"))?;
        let color =
            ColorSpace::from_u8(src[P_COLOR]).ok_or(NodeError::BadParams("unknown color space"))?;
        let stride = read_u32(src, P_STRIDE);
        let sample_period_sec = read_f64(src, P_PERIOD);

        if rows == 0 || cols == 0 {
            return Err(NodeError::BadParams("empty frame geometry"));
        }
        if (stride as usize) < cols as usize * pixel_type.bytes_per_pixel() {
            return Err(NodeError::BadParams("stride shorter than a pixel row"));
        }

        Ok(FrameParams {
            rows,
            cols,
            pixel_type,
            color,
            stride,
            sample_period_sec,
        })
    }

    fn required_bytes(params: &FrameParams) -> usize {
        PIXEL_OFFSET + params.pixel_bytes()
    }

    unsafe fn attach(region: *mut u8, params: &FrameParams) -> Self {
        Self {
            params: *params,
            stamp: region as *mut FrameStamp,
            pixels: region.add(PIXEL_OFFSET),
        }
    }

    fn stamp(&mut self, sample_number: u64, timestamp_ns: u64) {
        unsafe {
            (*self.stamp).sample_count = sample_number;
            (*self.stamp).timestamp_ns = timestamp_ns;
        }
    }

    fn to_owned(&self) -> FrameBuf {
        FrameBuf {
            params: self.params,
            sample_count: self.sample_count(),
            timestamp_ns: self.timestamp_ns(),
            pixels: self.pixels().to_vec(),
        }
    }

    fn copy_to(&self, dst: &mut FrameBuf) {
        dst.params = self.params;
        dst.sample_count = self.sample_count();
        dst.timestamp_ns = self.timestamp_ns();
        dst.pixels.resize(self.params.pixel_bytes(), 0);
        dst.pixels.copy_from_slice(self.pixels());
    }

    fn copy_from_owned(&mut self, src: &FrameBuf) {
        debug_assert_eq!(src.pixels.len(), self.params.pixel_bytes());
        unsafe {
            (*self.stamp).sample_count = src.sample_count;
            (*self.stamp).timestamp_ns = src.timestamp_ns;
        }
        self.pixels_mut().copy_from_slice(&src.pixels);
    }
}
