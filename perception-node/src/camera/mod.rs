use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use gatewatch_common::{BBox, CameraConfig};

pub mod ffmpeg;
pub mod multi_camera;
pub mod registry;
pub mod worker;

/// Decoded image, packed BGR24.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub const CHANNELS: usize = 3;

    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self { data, width, height }
    }

    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(vec![0; width as usize * height as usize * Self::CHANNELS], width, height)
    }

    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * Self::CHANNELS
    }

    /// Copy out the pixels inside `region` (clipped to the frame).
    /// Returns `None` when the clipped region is empty.
    pub fn crop(&self, region: &BBox) -> Option<Frame> {
        let r = region.clip(self.width, self.height);
        let (x1, y1) = (r.x1 as usize, r.y1 as usize);
        let (x2, y2) = (r.x2 as usize, r.y2 as usize);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        let stride = self.width as usize * Self::CHANNELS;
        let row_len = (x2 - x1) * Self::CHANNELS;
        let mut data = Vec::with_capacity(row_len * (y2 - y1));
        for y in y1..y2 {
            let start = y * stride + x1 * Self::CHANNELS;
            data.extend_from_slice(self.data.get(start..start + row_len)?);
        }
        Some(Frame::new(data, (x2 - x1) as u32, (y2 - y1) as u32))
    }
}

/// A frame on its way from a camera worker to processing. Never mutated.
#[derive(Debug, Clone)]
pub struct FrameMessage {
    pub camera_code: String,
    pub frame: Arc<Frame>,
    /// Capture time, unix seconds.
    pub timestamp: f64,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// An open video stream. `grab` is cheap and discardable, `retrieve` decodes
/// the most recently grabbed frame.
#[async_trait]
pub trait VideoSource: Send {
    async fn grab(&mut self) -> bool;
    async fn retrieve(&mut self) -> Option<Frame>;
    async fn release(&mut self);
}

#[async_trait]
pub trait VideoSourceFactory: Send + Sync {
    async fn open(&self, config: &CameraConfig) -> Result<Box<dyn VideoSource>>;
}
