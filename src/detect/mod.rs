mod backend;
mod backends;
mod engine;
mod morphology;
mod result;

pub use backend::{ModelFactory, ModelParams, MotionModel};
pub use backends::{AdaptiveBackground, AdaptiveFactory, ScriptedFactory, ScriptedModel};
pub use engine::MotionEngine;
pub use morphology::{box_blur, close, connected_regions, open};
pub use result::{MotionArea, MotionEvent, MotionResult};
