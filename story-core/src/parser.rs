//! Response tag parser.
//!
//! The storyteller is asked to wrap its reply in delimiter tags:
//!
//! ```text
//! [STORY]
//! The lantern gutters as you step into the crypt...
//! [/STORY]
//! [IMAGE]
//! a torch-lit crypt, stone sarcophagi, dramatic shadows
//! [/IMAGE]
//! ```
//!
//! Local models follow this loosely. They drop closing tags, change case,
//! emit `<think>` scratch regions, or ignore the format entirely. Parsing is
//! therefore total: it never fails and degrades to passing the whole reply
//! through as narrative.

use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;
use thiserror::Error;

/// An opening/closing delimiter pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPair {
    pub open: String,
    pub close: String,
}

impl TagPair {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }
}

/// The delimiter vocabulary the parser recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub narrative: TagPair,
    pub illustration: TagPair,
    /// Model scratch text, removed before anything else.
    pub reasoning: TagPair,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            narrative: TagPair::new("[STORY]", "[/STORY]"),
            illustration: TagPair::new("[IMAGE]", "[/IMAGE]"),
            reasoning: TagPair::new("<think>", "</think>"),
        }
    }
}

impl Markers {
    fn tokens(&self) -> [&str; 6] {
        [
            &self.narrative.open,
            &self.narrative.close,
            &self.illustration.open,
            &self.illustration.close,
            &self.reasoning.open,
            &self.reasoning.close,
        ]
    }
}

/// Errors building a parser from custom markers.
#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("Markers must not be blank")]
    Blank,

    #[error("Invalid marker pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Narrative and illustration directive extracted from one reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedResponse {
    pub narrative: String,
    /// Empty when the reply carried no directive.
    pub directive: String,
}

/// Interior of a located tagged region.
struct Region {
    interior: Range<usize>,
}

/// Extracts narrative and directive text from raw model output.
#[derive(Debug, Clone)]
pub struct ResponseParser {
    markers: Markers,
    reasoning: Regex,
    narrative_open: Regex,
    narrative_close: Regex,
    illustration_open: Regex,
    illustration_close: Regex,
    leftovers: Regex,
}

impl ResponseParser {
    pub fn new(markers: Markers) -> Result<Self, MarkerError> {
        if markers.tokens().iter().any(|t| t.trim().is_empty()) {
            return Err(MarkerError::Blank);
        }

        let literal = |token: &str| Regex::new(&format!("(?i){}", regex::escape(token)));

        let reasoning = Regex::new(&format!(
            "(?is){}.*?{}",
            regex::escape(&markers.reasoning.open),
            regex::escape(&markers.reasoning.close)
        ))?;

        let alternation = markers
            .tokens()
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");
        let leftovers = Regex::new(&format!("(?i)(?:{alternation})"))?;

        Ok(Self {
            narrative_open: literal(&markers.narrative.open)?,
            narrative_close: literal(&markers.narrative.close)?,
            illustration_open: literal(&markers.illustration.open)?,
            illustration_close: literal(&markers.illustration.close)?,
            reasoning,
            leftovers,
            markers,
        })
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    /// Split a raw reply into narrative and directive.
    pub fn parse(&self, raw: &str) -> ParsedResponse {
        let stripped = self.reasoning.replace_all(raw, "");
        let text: &str = &stripped;

        let narrative_region = find_region(
            text,
            &self.narrative_open,
            &self.narrative_close,
            &self.illustration_open,
        );
        let illustration_region = find_region(
            text,
            &self.illustration_open,
            &self.illustration_close,
            &self.narrative_open,
        );

        let narrative = match &narrative_region {
            Some(region) => &text[region.interior.clone()],
            None => text,
        };

        let directive = illustration_region
            .map(|region| &text[region.interior])
            .unwrap_or("");

        ParsedResponse {
            narrative: self.clean_text(narrative),
            directive: self.clean_text(directive),
        }
    }

    /// Remove stray marker tokens and surrounding whitespace.
    pub fn clean_text(&self, text: &str) -> String {
        self.leftovers.replace_all(text, "").trim().to_string()
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new(Markers::default()).expect("default markers are valid")
    }
}

/// Locate the first `open` marker and the nearest boundary after it: the
/// `close` marker, else the next `fallback` marker, else end of text.
fn find_region(text: &str, open: &Regex, close: &Regex, fallback: &Regex) -> Option<Region> {
    let open_match = open.find(text)?;
    let start = open_match.end();
    let rest = &text[start..];

    let interior_end = match close.find(rest) {
        Some(m) => start + m.start(),
        None => fallback
            .find(rest)
            .map_or(text.len(), |m| start + m.start()),
    };

    Some(Region {
        interior: start..interior_end,
    })
}

static DEFAULT_PARSER: Lazy<ResponseParser> = Lazy::new(ResponseParser::default);

/// Parse with the default `[STORY]` / `[IMAGE]` / `<think>` markers.
pub fn parse_story_response(raw: &str) -> ParsedResponse {
    DEFAULT_PARSER.parse(raw)
}

/// Strip default marker tokens from display text.
pub fn clean_story_text(text: &str) -> String {
    DEFAULT_PARSER.clean_text(text)
}
