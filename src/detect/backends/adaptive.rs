//! Adaptive background model: one running Gaussian per pixel.
//!
//! Per frame:
//! 1. box-blur the luminance plane;
//! 2. mark pixels whose squared deviation from the background mean exceeds
//!    `variance_threshold * variance` as foreground;
//! 3. fold the frame into the mean/variance estimates;
//! 4. open then close the mask with a 5x5 square;
//! 5. report connected regions and the foreground fraction.

use crate::detect::backend::{ModelFactory, ModelParams, MotionModel};
use crate::detect::morphology::{box_blur, close, connected_regions, open};
use crate::detect::result::MotionResult;
use crate::error::DetectionError;

const VARIANCE_INIT: f32 = 15.0;
const VARIANCE_MIN: f32 = 4.0;
const VARIANCE_MAX: f32 = 75.0;
/// Radius of the 5x5 structuring element.
const MORPH_RADIUS: usize = 2;

pub struct AdaptiveBackground {
    params: ModelParams,
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    frames: u64,
}

impl AdaptiveBackground {
    pub fn new(params: ModelParams) -> Self {
        Self {
            params,
            width: 0,
            height: 0,
            mean: Vec::new(),
            variance: Vec::new(),
            frames: 0,
        }
    }

    /// Learning rate for the next update. Early frames learn faster so the
    /// background settles before the configured history is reached.
    fn alpha(&self) -> f32 {
        let warmup = 1.0 / (2 * self.frames.max(1)) as f32;
        warmup.max(self.params.learning_rate)
    }

    fn reseed(&mut self, blurred: Vec<f32>, width: u32, height: u32) {
        self.variance = vec![VARIANCE_INIT; blurred.len()];
        self.mean = blurred;
        self.width = width;
        self.height = height;
        self.frames = 1;
    }
}

impl MotionModel for AdaptiveBackground {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn apply(
        &mut self,
        luma: &[u8],
        width: u32,
        height: u32,
    ) -> Result<MotionResult, DetectionError> {
        let (w, h) = (width as usize, height as usize);
        let expected = w
            .checked_mul(h)
            .ok_or(DetectionError::EmptyFrame)?;
        if expected == 0 {
            return Err(DetectionError::EmptyFrame);
        }
        if luma.len() != expected {
            return Err(DetectionError::BufferMismatch {
                expected,
                actual: luma.len(),
            });
        }

        let blurred = box_blur(luma, w, h, self.params.blur_radius as usize);

        if self.frames == 0 || self.width != width || self.height != height {
            if self.frames > 0 {
                log::info!(
                    "frame size changed {}x{} -> {}x{}; reseeding background",
                    self.width,
                    self.height,
                    width,
                    height
                );
            }
            self.reseed(blurred, width, height);
            return Ok(MotionResult::default());
        }

        let alpha = self.alpha();
        let threshold = self.params.variance_threshold;
        let mut mask = vec![0u8; expected];
        for (i, &value) in blurred.iter().enumerate() {
            let diff = value - self.mean[i];
            let dist2 = diff * diff;
            if dist2 > threshold * self.variance[i] {
                mask[i] = 1;
            }
            self.mean[i] += alpha * diff;
            let var = self.variance[i] + alpha * (dist2 - self.variance[i]);
            self.variance[i] = var.clamp(VARIANCE_MIN, VARIANCE_MAX);
        }
        self.frames += 1;

        let mask = close(&open(&mask, w, h, MORPH_RADIUS), w, h, MORPH_RADIUS);
        let foreground = mask.iter().filter(|&&v| v != 0).count();
        Ok(MotionResult {
            areas: connected_regions(&mask, w, h),
            motion_fraction: foreground as f32 / expected as f32,
        })
    }

    fn frames_seen(&self) -> u64 {
        self.frames
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AdaptiveFactory;

impl ModelFactory for AdaptiveFactory {
    fn create(&self, _device_id: &str, params: ModelParams) -> Box<dyn MotionModel> {
        Box::new(AdaptiveBackground::new(params))
    }
}
