//! LM Studio and ComfyUI implementations of the service traits.

use crate::service::{IllustrationService, NarrativeService, ServiceError};
use crate::turn::{HistoryEntry, IllustrationRef, Speaker};
use async_trait::async_trait;
use comfyui::{ComfyUi, TextToImage};
use lmstudio::{LmStudio, Message, Request};
use tracing::debug;

/// System prompt for turning a scene into an image prompt.
pub const DIRECTIVE_SYSTEM_PROMPT: &str = "You are an expert at creating detailed image prompts for AI image generation. Create a vivid, detailed visual description based on the scene provided.";

/// Sampling parameters for one kind of request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: usize,
}

/// Narrative service backed by an LM Studio server.
#[derive(Clone)]
pub struct LmStudioNarrator {
    client: LmStudio,
    story: Sampling,
    directive: Sampling,
}

impl LmStudioNarrator {
    pub fn new(client: LmStudio) -> Self {
        Self {
            client,
            story: Sampling {
                temperature: 0.8,
                max_tokens: 800,
            },
            directive: Sampling {
                temperature: 0.7,
                max_tokens: 200,
            },
        }
    }

    pub fn with_story_sampling(mut self, sampling: Sampling) -> Self {
        self.story = sampling;
        self
    }

    pub fn with_directive_sampling(mut self, sampling: Sampling) -> Self {
        self.directive = sampling;
        self
    }

    pub fn client(&self) -> &LmStudio {
        &self.client
    }

    fn story_request(
        &self,
        history: &[HistoryEntry],
        user_text: &str,
        guiding_instructions: &str,
    ) -> Request {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !guiding_instructions.trim().is_empty() {
            messages.push(Message::system(guiding_instructions));
        }
        messages.extend(history.iter().map(to_message));
        messages.push(Message::user(user_text));

        Request::new(messages)
            .with_temperature(self.story.temperature)
            .with_max_tokens(self.story.max_tokens)
    }

    fn directive_request(&self, narrative: &str) -> Request {
        let prompt = format!(
            "Based on this story scene, create a detailed image prompt for AI image generation (focus on visual details, setting, mood, and style):\n\n{narrative}\n\nImage prompt:"
        );

        Request::new(vec![
            Message::system(DIRECTIVE_SYSTEM_PROMPT),
            Message::user(prompt),
        ])
        .with_temperature(self.directive.temperature)
        .with_max_tokens(self.directive.max_tokens)
    }
}

fn to_message(entry: &HistoryEntry) -> Message {
    match entry.speaker {
        Speaker::User => Message::user(entry.text.clone()),
        Speaker::Assistant => Message::assistant(entry.text.clone()),
        Speaker::System => Message::system(entry.text.clone()),
    }
}

fn non_blank(content: String) -> Result<String, ServiceError> {
    if content.trim().is_empty() {
        Err(ServiceError::EmptyResponse)
    } else {
        Ok(content)
    }
}

#[async_trait]
impl NarrativeService for LmStudioNarrator {
    async fn continue_story(
        &self,
        history: &[HistoryEntry],
        user_text: &str,
        guiding_instructions: &str,
    ) -> Result<String, ServiceError> {
        let request = self.story_request(history, user_text, guiding_instructions);
        let response = self.client.complete(request).await?;
        debug!(finish_reason = ?response.finish_reason, "story reply received");
        non_blank(response.content)
    }

    async fn synthesize_illustration_directive(
        &self,
        narrative: &str,
    ) -> Result<String, ServiceError> {
        let response = self.client.complete(self.directive_request(narrative)).await?;
        non_blank(response.content)
    }
}

/// Illustration service backed by a ComfyUI server.
///
/// Each directive is dropped into a copy of the workflow template.
#[derive(Clone)]
pub struct ComfyUiIllustrator {
    client: ComfyUi,
    template: TextToImage,
}

impl ComfyUiIllustrator {
    pub fn new(client: ComfyUi) -> Self {
        let template = client.text_to_image("");
        Self { client, template }
    }

    pub fn with_template(mut self, template: TextToImage) -> Self {
        self.template = template;
        self
    }

    pub fn client(&self) -> &ComfyUi {
        &self.client
    }
}

#[async_trait]
impl IllustrationService for ComfyUiIllustrator {
    async fn generate_illustration(
        &self,
        directive: &str,
    ) -> Result<IllustrationRef, ServiceError> {
        let workflow = self.template.clone().with_prompt(directive).build();
        let url = self.client.execute(&workflow).await?;
        Ok(IllustrationRef::new(url))
    }
}
