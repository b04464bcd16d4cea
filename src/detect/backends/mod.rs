pub mod adaptive;
pub mod scripted;

pub use adaptive::{AdaptiveBackground, AdaptiveFactory};
pub use scripted::{ScriptedFactory, ScriptedModel};
