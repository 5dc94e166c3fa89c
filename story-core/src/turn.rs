//! Conversation turns.
//!
//! A story is an append-only sequence of [`Turn`]s. Once appended, a turn's
//! text never changes; the only mutation is attaching an illustration
//! through a [`TurnPatch`].

use crate::id::TurnId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
    System,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
            Speaker::System => "system",
        }
    }
}

/// Reference to a generated image, usually a fetchable URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IllustrationRef(String);

impl IllustrationRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IllustrationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub speaker: Speaker,
    /// Text shown to the reader.
    pub text: String,
    /// What the illustration should depict. Assistant turns only, never shown.
    pub illustration_directive: Option<String>,
    pub illustration: Option<IllustrationRef>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn new(speaker: Speaker, text: String, illustration_directive: Option<String>) -> Self {
        Self {
            id: TurnId::new(),
            speaker,
            text,
            illustration_directive,
            illustration: None,
            created_at: Utc::now(),
        }
    }

    /// A player action.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Speaker::User, text.into(), None)
    }

    /// A narrative reply. A blank directive is stored as `None`.
    pub fn assistant(text: impl Into<String>, directive: impl Into<String>) -> Self {
        Self::new(Speaker::Assistant, text.into(), non_empty(directive.into()))
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Speaker::System, text.into(), None)
    }

    /// The stored directive, if one was extracted.
    pub fn directive(&self) -> Option<&str> {
        self.illustration_directive.as_deref()
    }

    /// Apply an illustration patch.
    ///
    /// The reference always overwrites; the directive is only filled in when
    /// the turn has none.
    pub fn apply(&mut self, patch: TurnPatch) {
        self.illustration = Some(patch.illustration);
        if self.illustration_directive.is_none() {
            self.illustration_directive = patch.directive.and_then(non_empty);
        }
    }

    /// Speaker and text, as sent to the narrative service.
    pub fn to_history(&self) -> HistoryEntry {
        HistoryEntry {
            speaker: self.speaker,
            text: self.text.clone(),
        }
    }
}

/// The only legal mutation of an appended turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnPatch {
    pub illustration: IllustrationRef,
    pub directive: Option<String>,
}

impl TurnPatch {
    pub fn illustration(reference: IllustrationRef) -> Self {
        Self {
            illustration: reference,
            directive: None,
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }
}

/// A prior turn as context for the narrative service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub speaker: Speaker,
    pub text: String,
}

fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == text.len() {
        Some(text)
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_directive_is_absent() {
        let turn = Turn::assistant("The door creaks open.", "   ");
        assert_eq!(turn.speaker, Speaker::Assistant);
        assert!(turn.directive().is_none());

        let turn = Turn::assistant("The door creaks open.", " an old door ");
        assert_eq!(turn.directive(), Some("an old door"));
    }

    #[test]
    fn test_patch_overwrites_illustration_but_keeps_directive() {
        let mut turn = Turn::assistant("A storm rolls in.", "storm over the sea");

        turn.apply(
            TurnPatch::illustration(IllustrationRef::new("http://img/1")).with_directive("ignored"),
        );
        assert_eq!(turn.illustration.as_ref().unwrap().as_str(), "http://img/1");
        assert_eq!(turn.directive(), Some("storm over the sea"));

        turn.apply(TurnPatch::illustration(IllustrationRef::new("http://img/2")));
        assert_eq!(turn.illustration.as_ref().unwrap().as_str(), "http://img/2");
    }

    #[test]
    fn test_patch_fills_missing_directive() {
        let mut turn = Turn::assistant("A storm rolls in.", "");
        turn.apply(
            TurnPatch::illustration(IllustrationRef::new("http://img/1"))
                .with_directive("dark clouds"),
        );
        assert_eq!(turn.directive(), Some("dark clouds"));
    }

    #[test]
    fn test_speaker_serializes_lowercase() {
        let json = serde_json::to_string(&Speaker::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_to_history() {
        let turn = Turn::user("I open the door");
        let entry = turn.to_history();
        assert_eq!(entry.speaker, Speaker::User);
        assert_eq!(entry.text, "I open the door");

        let entry = Turn::system("Keep it short.").to_history();
        assert_eq!(entry.speaker, Speaker::System);
        assert_eq!(entry.text, "Keep it short.");
    }
}
