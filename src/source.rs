use crate::frame::{Frame, FrameError};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::sleep;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Stream unavailable: {0}")]
    StreamUnavailable(String),
    #[error("Timed out waiting for a frame after {0:?}")]
    Timeout(Duration),
    #[error("Corrupt frame: {0}")]
    CorruptFrame(#[from] FrameError),
}

impl SourceError {
    /// Stream faults require a reconnect; corrupt frames only skip the
    /// current cycle.
    pub fn is_stream_fault(&self) -> bool {
        matches!(
            self,
            SourceError::StreamUnavailable(_) | SourceError::Timeout(_)
        )
    }
}

/// One live camera feed. `next_frame` blocks with a bounded wait until a
/// frame arrives, the timeout elapses, or the connection fails. The
/// source never retries internally; the caller owns reconnection policy.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self, timeout: Duration) -> Result<Frame, SourceError>;
}

/// Establishes feed connections from opaque per-bay addresses. A fresh
/// source is connected after every stream fault.
#[async_trait]
pub trait SourceConnector: Send + Sync + 'static {
    type Source: FrameSource + 'static;

    async fn connect(&self, address: &str) -> Result<Self::Source, SourceError>;
}

/// Deterministic synthetic feed: a fixed gradient scene with per-pixel
/// sensor noise, optionally occupied for a stretch of every cycle. Stands
/// in for a network transport in local runs and tests.
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    pub width: u32,
    pub height: u32,
    pub frame_interval: Duration,
    /// `(period, occupied_len)`: frames `seq % period < occupied_len`
    /// render a vehicle-sized bright block in the bay center.
    pub occupancy_cycle: Option<(u64, u64)>,
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            frame_interval: Duration::from_millis(100),
            occupancy_cycle: None,
        }
    }
}

#[async_trait]
impl SourceConnector for SimulatedConnector {
    type Source = SimulatedSource;

    async fn connect(&self, address: &str) -> Result<Self::Source, SourceError> {
        tracing::debug!(address, "Connecting simulated feed");
        Ok(SimulatedSource {
            width: self.width,
            height: self.height,
            frame_interval: self.frame_interval,
            occupancy_cycle: self.occupancy_cycle,
            sequence: 0,
        })
    }
}

pub struct SimulatedSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    occupancy_cycle: Option<(u64, u64)>,
    sequence: u64,
}

impl SimulatedSource {
    fn render(&self, occupied: bool) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut rng = rand::rng();
        let mut pixels = vec![0u8; w * h];
        for y in 0..h {
            for x in 0..w {
                // Horizontal gradient plus a couple of counts of noise,
                // well under any sane difference threshold.
                let base = (x * 160 / w) as i16 + 40;
                let noise: i16 = rng.random_range(-2..=2);
                pixels[y * w + x] = (base + noise).clamp(0, 255) as u8;
            }
        }
        if occupied {
            // Bright block covering 60% of each side, centered.
            let (bw, bh) = (w * 6 / 10, h * 6 / 10);
            let (x0, y0) = ((w - bw) / 2, (h - bh) / 2);
            for y in y0..y0 + bh {
                for x in x0..x0 + bw {
                    pixels[y * w + x] = 230;
                }
            }
        }
        pixels
    }
}

#[async_trait]
impl FrameSource for SimulatedSource {
    async fn next_frame(&mut self, _timeout: Duration) -> Result<Frame, SourceError> {
        sleep(self.frame_interval).await;
        let occupied = self
            .occupancy_cycle
            .map(|(period, len)| period > 0 && self.sequence % period < len)
            .unwrap_or(false);
        let pixels = self.render(occupied);
        let frame = Frame::new(
            self.width,
            self.height,
            Bytes::from(pixels),
            SystemTime::now(),
            self.sequence,
        )?;
        self.sequence += 1;
        Ok(frame)
    }
}
