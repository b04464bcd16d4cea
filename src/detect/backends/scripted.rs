//! Scripted backend for tests and demos.
//!
//! Each device model replays a queue of motion fractions, one per frame, and
//! reports `fallback` once the queue is exhausted. A non-zero fraction is
//! reported as a single region covering that share of the frame.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::detect::backend::{ModelFactory, ModelParams, MotionModel};
use crate::detect::result::{MotionArea, MotionResult};
use crate::error::DetectionError;
use crate::lock;

pub struct ScriptedModel {
    script: VecDeque<f32>,
    fallback: f32,
    frames: u64,
}

impl ScriptedModel {
    pub fn new(script: impl IntoIterator<Item = f32>, fallback: f32) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback,
            frames: 0,
        }
    }
}

impl MotionModel for ScriptedModel {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn apply(
        &mut self,
        luma: &[u8],
        width: u32,
        height: u32,
    ) -> Result<MotionResult, DetectionError> {
        let total = width as usize * height as usize;
        if total == 0 {
            return Err(DetectionError::EmptyFrame);
        }
        if luma.len() != total {
            return Err(DetectionError::BufferMismatch {
                expected: total,
                actual: luma.len(),
            });
        }
        let fraction = self.script.pop_front().unwrap_or(self.fallback).clamp(0.0, 1.0);
        self.frames += 1;

        let area = (fraction * total as f32).round() as u32;
        let areas = if area > 0 {
            vec![MotionArea {
                x: 0,
                y: 0,
                width,
                height: area.div_ceil(width).min(height),
                area,
            }]
        } else {
            Vec::new()
        };
        Ok(MotionResult {
            areas,
            motion_fraction: fraction,
        })
    }

    fn frames_seen(&self) -> u64 {
        self.frames
    }
}

/// Hands out scripted models; scripts are looked up by device id.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<String, Vec<f32>>>,
    fallback: f32,
}

impl ScriptedFactory {
    pub fn new(fallback: f32) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    /// Set the script for the next model created for `device_id`.
    pub fn script(&self, device_id: &str, fractions: Vec<f32>) {
        lock(&self.scripts).insert(device_id.to_string(), fractions);
    }
}

impl ModelFactory for ScriptedFactory {
    fn create(&self, device_id: &str, _params: ModelParams) -> Box<dyn MotionModel> {
        let script = lock(&self.scripts).remove(device_id).unwrap_or_default();
        Box::new(ScriptedModel::new(script, self.fallback))
    }
}
