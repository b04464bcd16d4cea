use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::DetectionSettings;
use crate::error::DetectionError;
use crate::frame::DecodedFrame;
use crate::{lock, DeviceId};

use super::backend::{ModelFactory, ModelParams, MotionModel};
use super::result::MotionEvent;

type SharedModel = Arc<Mutex<Box<dyn MotionModel>>>;

/// Motion Detection Engine.
///
/// Holds one model per device, created lazily on the device's first frame.
/// The table lock only guards lookup and insertion; a frame is processed
/// under its own device's model lock, so devices never contend or touch
/// each other's background.
pub struct MotionEngine {
    factory: Arc<dyn ModelFactory>,
    models: Mutex<HashMap<DeviceId, SharedModel>>,
}

impl MotionEngine {
    pub fn new(factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            factory,
            models: Mutex::new(HashMap::new()),
        }
    }

    fn model_for(&self, device_id: &str, settings: &DetectionSettings) -> SharedModel {
        let mut models = lock(&self.models);
        models
            .entry(device_id.to_string())
            .or_insert_with(|| {
                let params = ModelParams {
                    learning_rate: settings.learning_rate,
                    variance_threshold: settings.variance_threshold,
                    blur_radius: settings.blur_radius,
                };
                let model = self.factory.create(device_id, params);
                log::debug!("created {} motion model for {}", model.name(), device_id);
                Arc::new(Mutex::new(model))
            })
            .clone()
    }

    /// Run `frame` through the device's model and build a motion event.
    ///
    /// Regions below `settings.min_contour_area` are dropped from the event.
    pub fn process(
        &self,
        device_id: &str,
        frame: &DecodedFrame,
        settings: &DetectionSettings,
    ) -> Result<MotionEvent, DetectionError> {
        let model = self.model_for(device_id, settings);
        let luma = frame.luminance();
        let result = {
            let mut guard = model.lock().map_err(|_| {
                DetectionError::ModelUnavailable(format!("model lock for {} poisoned", device_id))
            })?;
            guard.apply(&luma, frame.width, frame.height)?
        };
        let areas = result
            .areas
            .into_iter()
            .filter(|a| a.area >= settings.min_contour_area)
            .collect();
        Ok(MotionEvent {
            device_id: device_id.to_string(),
            timestamp_ms: frame.received_at_ms,
            observed_at: frame.received(),
            areas,
            motion_fraction: result.motion_fraction,
        })
    }

    /// Drop a device's model. Returns whether one existed.
    pub fn discard(&self, device_id: &str) -> bool {
        lock(&self.models).remove(device_id).is_some()
    }

    pub fn has_model(&self, device_id: &str) -> bool {
        lock(&self.models).contains_key(device_id)
    }

    /// Frames absorbed by a device's model, if it has one.
    pub fn frames_seen(&self, device_id: &str) -> Option<u64> {
        let model = lock(&self.models).get(device_id).cloned()?;
        let frames = model.lock().ok()?.frames_seen();
        Some(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::AdaptiveFactory;
    use crate::frame::test_frames::png;
    use crate::frame::FrameDecoder;
    use std::thread;

    fn decode(bytes: &[u8]) -> DecodedFrame {
        FrameDecoder::new(1 << 20, 1024).decode(bytes).unwrap()
    }

    #[test]
    fn models_are_created_lazily_and_discarded() {
        let engine = MotionEngine::new(Arc::new(AdaptiveFactory));
        let settings = DetectionSettings::default();
        assert!(!engine.has_model("cam-1"));
        engine.process("cam-1", &decode(&png(32, 32, 10)), &settings).unwrap();
        assert!(engine.has_model("cam-1"));
        assert!(engine.discard("cam-1"));
        assert!(!engine.discard("cam-1"));
    }

    #[test]
    fn device_models_are_isolated_under_concurrency() {
        let engine = Arc::new(MotionEngine::new(Arc::new(AdaptiveFactory)));
        let settings = DetectionSettings::default();
        let quiet = png(64, 48, 90);

        engine.process("cam-a", &decode(&quiet), &settings).unwrap();
        assert_eq!(engine.frames_seen("cam-a"), Some(1));

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let engine = engine.clone();
                let settings = settings.clone();
                thread::spawn(move || {
                    for n in 0..10u8 {
                        let frame = decode(&png(64, 48, n.wrapping_mul(25).wrapping_add(i)));
                        engine.process("cam-b", &frame, &settings).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(engine.frames_seen("cam-a"), Some(1));
        assert_eq!(engine.frames_seen("cam-b"), Some(40));

        let event = engine.process("cam-a", &decode(&quiet), &settings).unwrap();
        assert_eq!(event.motion_fraction, 0.0);
        assert!(event.areas.is_empty());
    }

    #[test]
    fn small_regions_are_filtered_by_min_area() {
        let engine = MotionEngine::new(Arc::new(AdaptiveFactory));
        let mut settings = DetectionSettings::default();
        settings.min_contour_area = 1_000_000;
        engine.process("cam-1", &decode(&png(64, 48, 20)), &settings).unwrap();
        let event = engine
            .process("cam-1", &decode(&png(64, 48, 240)), &settings)
            .unwrap();
        assert!(event.motion_fraction > 0.5);
        assert!(event.areas.is_empty());
    }
}
