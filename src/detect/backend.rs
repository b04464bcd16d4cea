use crate::error::DetectionError;

use super::result::MotionResult;

/// Parameters fixed when a device's model is created.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelParams {
    pub learning_rate: f32,
    pub variance_threshold: f32,
    pub blur_radius: u32,
}

/// Stateful motion model for exactly one device.
///
/// # Contract
///
/// - `apply` receives the frame's luminance plane and must not keep the slice.
/// - If `apply` returns an error the model state must be unchanged, so the
///   next frame of the device continues from the same background.
pub trait MotionModel: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Feed one frame and classify it against the background.
    fn apply(&mut self, luma: &[u8], width: u32, height: u32)
        -> Result<MotionResult, DetectionError>;

    /// Frames successfully absorbed into the model.
    fn frames_seen(&self) -> u64;
}

/// Creates one independent model per device.
pub trait ModelFactory: Send + Sync {
    fn create(&self, device_id: &str, params: ModelParams) -> Box<dyn MotionModel>;
}
