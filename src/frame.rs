use bytes::Bytes;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Pixel buffer length {got} does not match {width}x{height}")]
    BufferMismatch { width: u32, height: u32, got: usize },
    #[error("Frame has zero width or height")]
    EmptyFrame,
}

/// A single captured raster, grayscale, one byte per pixel in row-major
/// order. Frames are handed through exactly one detection cycle and then
/// dropped; the pixel buffer is immutable.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Bytes,
    captured_at: SystemTime,
    sequence: u64,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        pixels: Bytes,
        captured_at: SystemTime,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyFrame);
        }
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(FrameError::BufferMismatch {
                width,
                height,
                got: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
            captured_at,
            sequence,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}
