pub mod chat_controller;
pub mod fallback_supervisor;

pub use chat_controller::{ChatController, DECLINE_MESSAGE, DecisionResolution};
pub use fallback_supervisor::FallbackSupervisor;
