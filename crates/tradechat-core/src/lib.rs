//! Client-side streaming engine for the trading assistant chat.
//!
//! A message goes out over the push socket when it is connected, over an
//! SSE stream when configured, and otherwise (or when the primary tier stays
//! silent) through the request/response fallback endpoint. Chunks are folded
//! into a single assistant message of an always-sorted transcript, and
//! proposed trades wait in a decision gate until approved or declined.

pub mod controllers;
pub mod error;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;

pub use controllers::{ChatController, DecisionResolution};
pub use error::{ChatError, ChatResult, ClientError, ProtocolError};
pub use models::{Message, Role, TranscriptEvent, TranscriptStore};
pub use settings::ChatSettings;
