//! Story configuration.

use crate::parser::Markers;

/// Guiding instructions sent to the narrative service with every turn.
pub const DEFAULT_GUIDING_INSTRUCTIONS: &str = "\
You are an interactive storyteller creating an immersive roleplay experience.
Generate engaging, descriptive narratives based on user actions and choices.
Keep responses concise but vivid (2-4 paragraphs).
Focus on sensory details, emotions, and atmosphere.
Always end with a situation that invites user interaction.

Format every reply exactly like this:
[STORY]
the narrative, written in second person
[/STORY]
[IMAGE]
a single-paragraph visual description of the current scene for an image generator: subject, setting, lighting, mood and art style
[/IMAGE]";

/// Configuration for a story session.
///
/// `guiding_instructions` and `auto_illustrate` can be changed while the
/// story runs; `markers` is fixed when the session is created.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryConfig {
    /// System prompt for the narrative service.
    pub guiding_instructions: String,

    /// Illustrate each assistant turn that carries a directive.
    pub auto_illustrate: bool,

    /// Delimiters the response parser looks for.
    pub markers: Markers,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            guiding_instructions: DEFAULT_GUIDING_INSTRUCTIONS.to_string(),
            auto_illustrate: true,
            markers: Markers::default(),
        }
    }
}

impl StoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `STORY_GUIDING_INSTRUCTIONS` and
    /// `STORY_AUTO_ILLUSTRATE` when they are set.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(instructions) = std::env::var("STORY_GUIDING_INSTRUCTIONS") {
            if !instructions.trim().is_empty() {
                config.guiding_instructions = instructions;
            }
        }

        if let Some(enabled) = std::env::var("STORY_AUTO_ILLUSTRATE")
            .ok()
            .as_deref()
            .and_then(parse_flag)
        {
            config.auto_illustrate = enabled;
        }

        config
    }

    pub fn with_guiding_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.guiding_instructions = instructions.into();
        self
    }

    pub fn with_auto_illustrate(mut self, enabled: bool) -> Self {
        self.auto_illustrate = enabled;
        self
    }

    pub fn with_markers(mut self, markers: Markers) -> Self {
        self.markers = markers;
        self
    }
}

/// Parse an on/off flag as written in env files and commands.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoryConfig::default();
        assert!(config.auto_illustrate);
        assert!(config.guiding_instructions.contains("[STORY]"));
        assert_eq!(config.markers, Markers::default());
    }

    #[test]
    fn test_builder() {
        let config = StoryConfig::new()
            .with_guiding_instructions("Write noir.")
            .with_auto_illustrate(false);

        assert_eq!(config.guiding_instructions, "Write noir.");
        assert!(!config.auto_illustrate);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("ON"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("sometimes"), None);
    }
}
