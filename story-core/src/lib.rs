//! Interactive illustrated storytelling.
//!
//! This crate provides:
//! - Turn orchestration against a local narrative model (LM Studio)
//! - Background scene illustration through a local image pipeline (ComfyUI)
//! - A tolerant parser for `[STORY]` / `[IMAGE]` tagged replies
//! - A task-owned conversation store that survives resets mid-flight
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use story_core::{ComfyUiIllustrator, LmStudioNarrator, StoryConfig, StoryTeller};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let narrator = LmStudioNarrator::new(lmstudio::LmStudio::from_env()?);
//!     let illustrator = ComfyUiIllustrator::new(comfyui::ComfyUi::from_env()?);
//!
//!     let teller = StoryTeller::new(
//!         StoryConfig::from_env(),
//!         Arc::new(narrator),
//!         Arc::new(illustrator),
//!     )?;
//!
//!     let outcome = teller.submit_turn("I push open the lighthouse door").await?;
//!     println!("{}", outcome.narrative);
//!
//!     teller.wait_for_illustrations().await;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod config;
pub mod id;
pub mod orchestrator;
pub mod parser;
pub mod service;
pub mod store;
pub mod testing;
pub mod turn;

// Primary public API
pub use adapters::{ComfyUiIllustrator, LmStudioNarrator, Sampling};
pub use config::{StoryConfig, DEFAULT_GUIDING_INSTRUCTIONS};
pub use id::TurnId;
pub use orchestrator::{
    IllustrationEvent, RegenerateOutcome, StoryError, StoryTeller, TurnOutcome,
    NARRATIVE_FAILURE_MESSAGE,
};
pub use parser::{
    clean_story_text, parse_story_response, MarkerError, Markers, ParsedResponse,
    ResponseParser, TagPair,
};
pub use service::{IllustrationService, NarrativeService, ServiceError};
pub use store::{spawn_store, ConversationLog, StoreHandle};
pub use testing::{MockIllustrator, MockNarrator, MockReply};
pub use turn::{HistoryEntry, IllustrationRef, Speaker, Turn, TurnPatch};
