use crate::background::BackgroundModel;
use crate::frame::Frame;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Background model has no reference yet")]
    EmptyReference,
    #[error("Frame is {got_w}x{got_h} but the reference is {want_w}x{want_h}")]
    DimensionMismatch {
        want_w: u32,
        want_h: u32,
        got_w: u32,
        got_h: u32,
    },
}

/// Frame-level verdict for one detection cycle.
#[derive(Debug, Clone, Copy)]
pub struct DetectionResult {
    pub confidence: f32,
    pub occupied: bool,
    pub timestamp: SystemTime,
}

/// Change detection against the learned background, confined to a
/// centered region of interest. A parked vehicle under a fixed overhead
/// camera is a large stationary region of pixel change, so a thresholded
/// difference beats a classifier here.
#[derive(Debug, Clone)]
pub struct OccupancyDetector {
    roi_fraction: f32,
    diff_threshold: f32,
    occupancy_threshold: f32,
}

struct Roi {
    x0: usize,
    y0: usize,
    w: usize,
    h: usize,
}

impl OccupancyDetector {
    pub fn new(roi_fraction: f32, diff_threshold: f32, occupancy_threshold: f32) -> Self {
        Self {
            roi_fraction,
            diff_threshold,
            occupancy_threshold,
        }
    }

    fn roi(&self, width: usize, height: usize) -> Roi {
        let margin_x = (width as f32 * (1.0 - self.roi_fraction) / 2.0) as usize;
        let margin_y = (height as f32 * (1.0 - self.roi_fraction) / 2.0) as usize;
        Roi {
            x0: margin_x,
            y0: margin_y,
            w: (width - 2 * margin_x).max(1),
            h: (height - 2 * margin_y).max(1),
        }
    }

    pub fn detect(
        &self,
        frame: &Frame,
        model: &BackgroundModel,
    ) -> Result<DetectionResult, DetectorError> {
        let reference = model.reference();
        if reference.is_empty() {
            return Err(DetectorError::EmptyReference);
        }
        if frame.width() != model.width() || frame.height() != model.height() {
            return Err(DetectorError::DimensionMismatch {
                want_w: model.width(),
                want_h: model.height(),
                got_w: frame.width(),
                got_h: frame.height(),
            });
        }

        let width = frame.width() as usize;
        let roi = self.roi(width, frame.height() as usize);
        let pixels = frame.pixels();

        let mut mask = vec![false; roi.w * roi.h];
        for y in 0..roi.h {
            for x in 0..roi.w {
                let idx = (roi.y0 + y) * width + roi.x0 + x;
                let diff = (pixels[idx] as f32 - reference[idx]).abs();
                mask[y * roi.w + x] = diff > self.diff_threshold;
            }
        }

        // Opening drops isolated sensor/compression speckle, closing
        // fills pinholes inside a real change region.
        let mask = dilate(&erode(&mask, roi.w, roi.h), roi.w, roi.h);
        let mask = erode(&dilate(&mask, roi.w, roi.h), roi.w, roi.h);

        let changed = mask.iter().filter(|&&m| m).count();
        let confidence = (changed as f32 / (roi.w * roi.h) as f32).clamp(0.0, 1.0);

        Ok(DetectionResult {
            confidence,
            occupied: confidence >= self.occupancy_threshold,
            timestamp: frame.captured_at(),
        })
    }
}

fn erode(mask: &[bool], w: usize, h: usize) -> Vec<bool> {
    morph(mask, w, h, true)
}

fn dilate(mask: &[bool], w: usize, h: usize) -> Vec<bool> {
    morph(mask, w, h, false)
}

// 3x3 structuring element. With `all` this is erosion (every neighbor
// set), otherwise dilation (any neighbor set). Out-of-bounds neighbors
// are neutral for the operation at hand, so a change region touching the
// ROI border is not eaten away by the closing pass. Both operators are
// monotone in set inclusion, so the changed-pixel count, and with it the
// confidence, is monotone in the raw change mask.
fn morph(mask: &[bool], w: usize, h: usize, all: bool) -> Vec<bool> {
    let mut out = vec![false; mask.len()];
    for y in 0..h {
        for x in 0..w {
            let mut acc = all;
            'kernel: for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let ny = y as i64 + dy;
                    let nx = x as i64 + dx;
                    let in_bounds = ny >= 0 && nx >= 0 && ny < h as i64 && nx < w as i64;
                    let set = if in_bounds {
                        mask[ny as usize * w + nx as usize]
                    } else {
                        all
                    };
                    if all && !set {
                        acc = false;
                        break 'kernel;
                    }
                    if !all && set {
                        acc = true;
                        break 'kernel;
                    }
                }
            }
            out[y * w + x] = acc;
        }
    }
    out
}
