//! External generation services.
//!
//! The orchestrator only talks to these traits. Production adapters live in
//! [`crate::adapters`]; scripted fakes live in [`crate::testing`].

use crate::turn::{HistoryEntry, IllustrationRef};
use async_trait::async_trait;
use thiserror::Error;

/// Errors from a generation service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Narrative service error: {0}")]
    Narrative(#[from] lmstudio::Error),

    #[error("Illustration service error: {0}")]
    Illustration(#[from] comfyui::Error),

    #[error("Service returned an empty response")]
    EmptyResponse,

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Produces story text.
#[async_trait]
pub trait NarrativeService: Send + Sync {
    /// Continue the story after `user_text`.
    ///
    /// `history` holds every prior turn, oldest first, and does not include
    /// `user_text`. The raw reply is returned; tag parsing happens upstream.
    async fn continue_story(
        &self,
        history: &[HistoryEntry],
        user_text: &str,
        guiding_instructions: &str,
    ) -> Result<String, ServiceError>;

    /// Describe `narrative` as a prompt for an image generator.
    async fn synthesize_illustration_directive(
        &self,
        narrative: &str,
    ) -> Result<String, ServiceError>;
}

/// Produces images.
#[async_trait]
pub trait IllustrationService: Send + Sync {
    async fn generate_illustration(&self, directive: &str)
        -> Result<IllustrationRef, ServiceError>;
}
