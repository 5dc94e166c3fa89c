//! Testing utilities for stories.
//!
//! This module provides tools for integration testing:
//! - `MockNarrator` and `MockIllustrator` for deterministic tests without servers
//! - Gates for holding a mock call open until the test releases it
//! - Assertion helpers for verifying the turn log

use crate::service::{IllustrationService, NarrativeService, ServiceError};
use crate::turn::{HistoryEntry, IllustrationRef, Speaker, Turn};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A scripted reply from a mock service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Succeed with this text (narrative reply, directive, or image reference).
    Text(String),
    /// Fail with [`ServiceError::Unavailable`] carrying this reason.
    Fail(String),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        MockReply::Fail(reason.into())
    }

    fn into_result(self) -> Result<String, ServiceError> {
        match self {
            MockReply::Text(text) => Ok(text),
            MockReply::Fail(reason) => Err(ServiceError::Unavailable(reason)),
        }
    }
}

/// What the narrator was asked to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryRequest {
    pub history: Vec<HistoryEntry>,
    pub user_text: String,
    pub guiding_instructions: String,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A narrative service that returns scripted replies in order.
///
/// When the script runs out, a fixed tagged reply is returned.
#[derive(Default)]
pub struct MockNarrator {
    replies: Mutex<VecDeque<MockReply>>,
    directive_replies: Mutex<VecDeque<MockReply>>,
    gate: Option<Arc<Notify>>,
    requests: Mutex<Vec<StoryRequest>>,
    directive_requests: Mutex<Vec<String>>,
    story_calls: AtomicUsize,
}

impl MockNarrator {
    /// Create a mock narrator with scripted story replies.
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Script replies for directive synthesis.
    pub fn with_directive_replies(mut self, replies: Vec<MockReply>) -> Self {
        self.directive_replies = Mutex::new(replies.into());
        self
    }

    /// Hold every story call until `gate` is notified once per call.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Add a story reply to the end of the script.
    pub fn queue_reply(&self, reply: MockReply) {
        lock(&self.replies).push_back(reply);
    }

    /// Number of story calls started, including ones still held by the gate.
    pub fn story_calls(&self) -> usize {
        self.story_calls.load(Ordering::SeqCst)
    }

    pub fn directive_calls(&self) -> usize {
        lock(&self.directive_requests).len()
    }

    /// Every story request received, oldest first.
    pub fn requests(&self) -> Vec<StoryRequest> {
        lock(&self.requests).clone()
    }

    /// Every narrative passed to directive synthesis, oldest first.
    pub fn directive_requests(&self) -> Vec<String> {
        lock(&self.directive_requests).clone()
    }
}

#[async_trait]
impl NarrativeService for MockNarrator {
    async fn continue_story(
        &self,
        history: &[HistoryEntry],
        user_text: &str,
        guiding_instructions: &str,
    ) -> Result<String, ServiceError> {
        self.story_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(StoryRequest {
            history: history.to_vec(),
            user_text: user_text.to_string(),
            guiding_instructions: guiding_instructions.to_string(),
        });

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let reply = lock(&self.replies).pop_front();
        reply
            .unwrap_or_else(|| {
                MockReply::text("[STORY]The narrator has no more scripted replies.[/STORY]")
            })
            .into_result()
    }

    async fn synthesize_illustration_directive(
        &self,
        narrative: &str,
    ) -> Result<String, ServiceError> {
        lock(&self.directive_requests).push(narrative.to_string());

        let reply = lock(&self.directive_replies).pop_front();
        reply
            .unwrap_or_else(|| MockReply::text("a scripted scene"))
            .into_result()
    }
}

/// An illustration service that returns scripted references in order.
///
/// When the script runs out, `mock://illustration/<n>` is returned, where
/// `n` counts calls from 1.
#[derive(Default)]
pub struct MockIllustrator {
    replies: Mutex<VecDeque<MockReply>>,
    gate: Option<Arc<Notify>>,
    directives: Mutex<Vec<String>>,
    completed: AtomicUsize,
}

impl MockIllustrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// Hold every call until `gate` is notified once per call.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Number of calls started.
    pub fn calls(&self) -> usize {
        lock(&self.directives).len()
    }

    /// Number of calls that have returned.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Every directive received, oldest first.
    pub fn directives(&self) -> Vec<String> {
        lock(&self.directives).clone()
    }
}

#[async_trait]
impl IllustrationService for MockIllustrator {
    async fn generate_illustration(
        &self,
        directive: &str,
    ) -> Result<IllustrationRef, ServiceError> {
        let call = {
            let mut directives = lock(&self.directives);
            directives.push(directive.to_string());
            directives.len()
        };

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let reply = lock(&self.replies).pop_front();
        let result = reply
            .unwrap_or_else(|| MockReply::text(format!("mock://illustration/{call}")))
            .into_result()
            .map(IllustrationRef::new);

        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

// ============================================================================
// Assertion helpers
// ============================================================================

/// Assert the log alternates user/assistant, starting with a user turn.
#[track_caller]
pub fn assert_alternating(turns: &[Turn]) {
    for (index, turn) in turns.iter().enumerate() {
        let expected = if index % 2 == 0 {
            Speaker::User
        } else {
            Speaker::Assistant
        };
        assert_eq!(
            turn.speaker, expected,
            "turn {index} should be {expected:?}, got {:?}: {:?}",
            turn.speaker, turn.text
        );
    }
}

/// Assert the turn at `index` has the given illustration reference.
#[track_caller]
pub fn assert_illustrated(turns: &[Turn], index: usize, reference: &str) {
    let turn = turns
        .get(index)
        .unwrap_or_else(|| panic!("no turn at index {index} (log has {})", turns.len()));
    assert_eq!(
        turn.illustration.as_ref().map(IllustrationRef::as_str),
        Some(reference),
        "turn {index} illustration mismatch"
    );
}

/// Assert no turn carries an illustration.
#[track_caller]
pub fn assert_no_illustrations(turns: &[Turn]) {
    if let Some(turn) = turns.iter().find(|t| t.illustration.is_some()) {
        panic!(
            "expected no illustrations, turn {} has {:?}",
            turn.id, turn.illustration
        );
    }
}

/// Assert no displayed text contains a marker token.
#[track_caller]
pub fn assert_no_markers(turns: &[Turn]) {
    const TOKENS: [&str; 6] = ["[story]", "[/story]", "[image]", "[/image]", "<think>", "</think>"];
    for turn in turns {
        let lower = turn.text.to_lowercase();
        if let Some(token) = TOKENS.iter().find(|t| lower.contains(*t)) {
            panic!("turn {} text contains marker {token}: {:?}", turn.id, turn.text);
        }
    }
}
