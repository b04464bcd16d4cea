use std::time::Instant;

use crate::DeviceId;

/// Bounding box of one connected foreground region, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionArea {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Foreground pixel count of the region.
    pub area: u32,
}

/// Output of one motion model pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MotionResult {
    /// All regions found; area filtering happens in the engine.
    pub areas: Vec<MotionArea>,
    /// Foreground pixels / total pixels, after noise filtering.
    pub motion_fraction: f32,
}

/// Result of processing one frame for one device. Consumed immediately by
/// the alert governor and not retained.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionEvent {
    pub device_id: DeviceId,
    pub timestamp_ms: u64,
    /// Monotonic instant used for cooldown accounting.
    pub observed_at: Instant,
    pub areas: Vec<MotionArea>,
    pub motion_fraction: f32,
}

impl MotionEvent {
    pub fn area_count(&self) -> usize {
        self.areas.len()
    }
}
