use crate::frame::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error("Frame is {got_w}x{got_h} but the model reference is {want_w}x{want_h}")]
    DimensionMismatch {
        want_w: u32,
        want_h: u32,
        got_w: u32,
        got_h: u32,
    },
}

/// Adaptive reference image of the empty bay. A cumulative mean over the
/// learning window builds the initial reference; afterwards a slow
/// exponential moving average, fed only with frames classified as
/// unoccupied, tracks gradual lighting drift. Occupied frames never touch
/// the reference, so a parked vehicle is not absorbed into it.
#[derive(Debug)]
pub struct BackgroundModel {
    width: u32,
    height: u32,
    reference: Vec<f32>,
    samples: u32,
    learning_frames: u32,
    decay: f32,
}

impl BackgroundModel {
    pub fn new(learning_frames: u32, decay: f32) -> Self {
        Self {
            width: 0,
            height: 0,
            reference: Vec::new(),
            samples: 0,
            learning_frames,
            decay,
        }
    }

    /// Warm once the configured number of unoccupied samples has been
    /// absorbed; only a warm model may drive status transitions.
    pub fn is_warm(&self) -> bool {
        self.samples >= self.learning_frames
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Empty until the first frame has been learned.
    pub fn reference(&self) -> &[f32] {
        &self.reference
    }

    fn check_dimensions(&self, frame: &Frame) -> Result<(), BackgroundError> {
        if self.reference.is_empty() {
            return Ok(());
        }
        if frame.width() != self.width || frame.height() != self.height {
            return Err(BackgroundError::DimensionMismatch {
                want_w: self.width,
                want_h: self.height,
                got_w: frame.width(),
                got_h: frame.height(),
            });
        }
        Ok(())
    }

    /// Fold one unoccupied frame into the learning-phase cumulative mean.
    pub fn learn(&mut self, frame: &Frame) -> Result<(), BackgroundError> {
        self.check_dimensions(frame)?;
        if self.reference.is_empty() {
            self.width = frame.width();
            self.height = frame.height();
            self.reference = frame.pixels().iter().map(|&p| p as f32).collect();
            self.samples = 1;
            return Ok(());
        }
        let n = self.samples as f32;
        for (acc, &p) in self.reference.iter_mut().zip(frame.pixels()) {
            *acc += (p as f32 - *acc) / (n + 1.0);
        }
        self.samples += 1;
        Ok(())
    }

    /// Steady-state update: pull the reference toward an unoccupied frame
    /// by the configured decay.
    pub fn absorb(&mut self, frame: &Frame) -> Result<(), BackgroundError> {
        self.check_dimensions(frame)?;
        if self.reference.is_empty() {
            return self.learn(frame);
        }
        for (acc, &p) in self.reference.iter_mut().zip(frame.pixels()) {
            *acc += self.decay * (p as f32 - *acc);
        }
        Ok(())
    }

    /// Discard the reference and restart the learning phase. Needed when
    /// the learned background is known to be wrong, e.g. it was captured
    /// around a misclassified vehicle.
    pub fn reset(&mut self) {
        self.width = 0;
        self.height = 0;
        self.reference.clear();
        self.samples = 0;
    }
}
