//! StoryTeller - the primary public API for an illustrated story.
//!
//! One user action becomes two turns: the user turn, appended immediately,
//! and the assistant turn built from the narrative service's reply. If that
//! reply carries an illustration directive and auto-illustration is on, the
//! image is generated by a background task that patches the assistant turn
//! when it finishes. Nothing waits for it, and a failure there never touches
//! the story text.
//!
//! At most one turn submission or regeneration runs at a time. Starting a
//! new story is always allowed; illustrations still in flight for the old
//! story find their turns gone and are dropped.

use crate::config::StoryConfig;
use crate::id::TurnId;
use crate::parser::{MarkerError, ResponseParser};
use crate::service::{IllustrationService, NarrativeService, ServiceError};
use crate::store::{spawn_store, StoreHandle};
use crate::turn::{IllustrationRef, Speaker, Turn, TurnPatch};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// Assistant text stored when the narrative service fails.
pub const NARRATIVE_FAILURE_MESSAGE: &str = "Sorry, I encountered an error generating the story. Please make sure LM Studio is running and try again.";

/// Errors from StoryTeller operations.
#[derive(Debug, Error)]
pub enum StoryError {
    #[error("Nothing to submit: input is empty")]
    EmptyInput,

    #[error("Another story operation is already in progress")]
    Busy,
}

/// Result of one submitted turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub user_turn: TurnId,
    pub assistant_turn: TurnId,

    /// Text of the assistant turn.
    pub narrative: String,

    /// The narrative service failed and `narrative` is the apology message.
    pub narrative_failed: bool,

    /// A background illustration was started for the assistant turn.
    pub illustration_pending: bool,
}

/// Result of regenerating the latest illustration.
#[derive(Debug, Clone, PartialEq)]
pub enum RegenerateOutcome {
    /// There is no assistant turn to illustrate.
    NoAssistantTurn,

    /// The turn was patched with a new image.
    Illustrated {
        turn_id: TurnId,
        reference: IllustrationRef,
    },

    /// The story was reset before the image arrived.
    Stale { turn_id: TurnId },

    /// Directive synthesis or image generation failed. The turn is unchanged.
    Failed { turn_id: TurnId, reason: String },
}

/// An illustration that was attached to a turn still in the story.
#[derive(Debug, Clone, PartialEq)]
pub struct IllustrationEvent {
    pub turn_id: TurnId,
    pub reference: IllustrationRef,
}

const EVENT_BUFFER: usize = 32;

/// Drives an illustrated story.
///
/// Cheap to clone; clones share the same story. Must be created inside a
/// tokio runtime.
#[derive(Clone)]
pub struct StoryTeller {
    inner: Arc<Inner>,
}

struct Inner {
    store: StoreHandle,
    narrator: Arc<dyn NarrativeService>,
    illustrator: Arc<dyn IllustrationService>,
    parser: ResponseParser,
    busy: AtomicBool,
    illustrations: Mutex<JoinSet<()>>,
    events: broadcast::Sender<IllustrationEvent>,
}

/// Clears the busy flag on every exit path.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl StoryTeller {
    /// Create a storyteller with an empty story.
    ///
    /// Fails only if `config.markers` cannot be compiled.
    pub fn new(
        config: StoryConfig,
        narrator: Arc<dyn NarrativeService>,
        illustrator: Arc<dyn IllustrationService>,
    ) -> Result<Self, MarkerError> {
        let parser = ResponseParser::new(config.markers.clone())?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            inner: Arc::new(Inner {
                store: spawn_store(config),
                narrator,
                illustrator,
                parser,
                busy: AtomicBool::new(false),
                illustrations: Mutex::new(JoinSet::new()),
                events,
            }),
        })
    }

    /// Handle to the underlying conversation store.
    pub fn store(&self) -> &StoreHandle {
        &self.inner.store
    }

    /// Receive an event each time an illustration is attached, from the
    /// background or from a regeneration. Stale illustrations are not sent.
    pub fn subscribe_illustrations(&self) -> broadcast::Receiver<IllustrationEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// Every turn, oldest first.
    pub async fn turns(&self) -> Vec<Turn> {
        self.inner.store.snapshot().await
    }

    pub async fn config(&self) -> StoryConfig {
        self.inner.store.config().await
    }

    pub async fn set_guiding_instructions(&self, instructions: impl Into<String>) {
        self.inner.store.set_guiding_instructions(instructions).await;
    }

    pub async fn set_auto_illustrate(&self, enabled: bool) {
        self.inner.store.set_auto_illustrate(enabled).await;
    }

    fn acquire(&self) -> Result<BusyGuard<'_>, StoryError> {
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| StoryError::Busy)?;
        Ok(BusyGuard(&self.inner.busy))
    }

    fn illustrations(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner
            .illustrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submit a player action and append the resulting turns.
    ///
    /// Returns once the assistant turn is in the store. A narrative service
    /// failure is not an error: the apology text is stored instead and
    /// `narrative_failed` is set.
    #[instrument(skip_all)]
    pub async fn submit_turn(&self, user_text: &str) -> Result<TurnOutcome, StoryError> {
        let user_text = user_text.trim();
        if user_text.is_empty() {
            return Err(StoryError::EmptyInput);
        }
        let _busy = self.acquire()?;
        let store = &self.inner.store;

        let config = store.config().await;
        let history = store.history().await;

        let user_turn = Turn::user(user_text);
        let user_id = user_turn.id;
        store.append(user_turn).await;
        debug!(turn = %user_id, history = history.len(), "user turn appended");

        let reply = self
            .inner
            .narrator
            .continue_story(&history, user_text, &config.guiding_instructions)
            .await
            .and_then(|raw| {
                let parsed = self.inner.parser.parse(&raw);
                if parsed.narrative.is_empty() {
                    Err(ServiceError::EmptyResponse)
                } else {
                    Ok(parsed)
                }
            });

        let (assistant, narrative_failed) = match reply {
            Ok(parsed) => (Turn::assistant(parsed.narrative, parsed.directive), false),
            Err(e) => {
                warn!("Narrative generation failed: {e}");
                (Turn::assistant(NARRATIVE_FAILURE_MESSAGE, ""), true)
            }
        };

        let assistant_id = assistant.id;
        let narrative = assistant.text.clone();
        let directive = assistant.illustration_directive.clone();
        store.append(assistant).await;

        let illustration_pending = match directive {
            Some(directive) if config.auto_illustrate => {
                self.spawn_illustration(assistant_id, directive);
                true
            }
            _ => false,
        };

        info!(
            turn = %assistant_id,
            narrative_failed,
            illustration_pending,
            "assistant turn appended"
        );

        Ok(TurnOutcome {
            user_turn: user_id,
            assistant_turn: assistant_id,
            narrative,
            narrative_failed,
            illustration_pending,
        })
    }

    fn spawn_illustration(&self, turn_id: TurnId, directive: String) {
        let illustrator = Arc::clone(&self.inner.illustrator);
        let store = self.inner.store.clone();
        let events = self.inner.events.clone();

        let task = async move {
            match illustrator.generate_illustration(&directive).await {
                Ok(reference) => {
                    let patch = TurnPatch::illustration(reference.clone());
                    if store.patch(turn_id, patch).await {
                        info!("illustration attached");
                        // Err only means nobody is subscribed
                        let _ = events.send(IllustrationEvent { turn_id, reference });
                    } else {
                        debug!("story was reset, dropping illustration");
                    }
                }
                Err(e) => warn!("Illustration failed: {e}"),
            }
        };

        let mut illustrations = self.illustrations();
        while illustrations.try_join_next().is_some() {}
        illustrations.spawn(task.instrument(info_span!("illustration", turn = %turn_id)));
    }

    /// Discard the story and optionally submit a first action.
    ///
    /// The reset itself never fails, even while another operation is in
    /// progress; the follow-up submission may still return
    /// [`StoryError::Busy`].
    #[instrument(skip_all)]
    pub async fn start_new_story(
        &self,
        first_action: Option<&str>,
    ) -> Result<Option<TurnOutcome>, StoryError> {
        self.inner.store.reset().await;
        info!("new story started");

        match first_action.map(str::trim).filter(|a| !a.is_empty()) {
            Some(action) => self.submit_turn(action).await.map(Some),
            None => Ok(None),
        }
    }

    /// Generate a fresh image for the most recent assistant turn.
    ///
    /// Uses the turn's stored directive, or asks the narrative service to
    /// write one from the turn's text. A synthesized directive is stored on
    /// the turn together with the image.
    #[instrument(skip_all)]
    pub async fn regenerate_last_illustration(&self) -> Result<RegenerateOutcome, StoryError> {
        let turns = self.inner.store.snapshot().await;
        let Some(target) = turns.iter().rev().find(|t| t.speaker == Speaker::Assistant) else {
            return Ok(RegenerateOutcome::NoAssistantTurn);
        };
        let _busy = self.acquire()?;
        let turn_id = target.id;

        let (directive, synthesized) = match target.directive() {
            Some(directive) => (directive.to_string(), false),
            None => match self.synthesize_directive(&target.text).await {
                Ok(directive) => (directive, true),
                Err(e) => {
                    warn!(turn = %turn_id, "Directive synthesis failed: {e}");
                    return Ok(RegenerateOutcome::Failed {
                        turn_id,
                        reason: e.to_string(),
                    });
                }
            },
        };

        let reference = match self.inner.illustrator.generate_illustration(&directive).await {
            Ok(reference) => reference,
            Err(e) => {
                warn!(turn = %turn_id, "Illustration failed: {e}");
                return Ok(RegenerateOutcome::Failed {
                    turn_id,
                    reason: e.to_string(),
                });
            }
        };

        let mut patch = TurnPatch::illustration(reference.clone());
        if synthesized {
            patch = patch.with_directive(directive);
        }

        if self.inner.store.patch(turn_id, patch).await {
            info!(turn = %turn_id, "illustration regenerated");
            let _ = self.inner.events.send(IllustrationEvent {
                turn_id,
                reference: reference.clone(),
            });
            Ok(RegenerateOutcome::Illustrated { turn_id, reference })
        } else {
            debug!(turn = %turn_id, "story was reset during regeneration");
            Ok(RegenerateOutcome::Stale { turn_id })
        }
    }

    /// The reply may itself be tagged or carry reasoning; prefer its
    /// directive region, else its cleaned text.
    async fn synthesize_directive(&self, narrative: &str) -> Result<String, ServiceError> {
        let raw = self
            .inner
            .narrator
            .synthesize_illustration_directive(narrative)
            .await?;
        let parsed = self.inner.parser.parse(&raw);

        let directive = if parsed.directive.is_empty() {
            parsed.narrative
        } else {
            parsed.directive
        };
        if directive.is_empty() {
            return Err(ServiceError::EmptyResponse);
        }
        Ok(directive)
    }

    /// Wait until every background illustration has finished.
    ///
    /// Illustrations spawned while waiting are waited for too.
    pub async fn wait_for_illustrations(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.illustrations());
            if pending.is_empty() {
                break;
            }
            while let Some(result) = pending.join_next().await {
                if let Err(e) = result {
                    warn!("Illustration task ended abnormally: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockIllustrator, MockNarrator, MockReply};

    fn teller(narrator: MockNarrator, illustrator: MockIllustrator) -> StoryTeller {
        StoryTeller::new(StoryConfig::default(), Arc::new(narrator), Arc::new(illustrator)).unwrap()
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected() {
        let narrator = Arc::new(MockNarrator::new(vec![]));
        let teller = StoryTeller::new(
            StoryConfig::default(),
            narrator.clone(),
            Arc::new(MockIllustrator::new()),
        )
        .unwrap();

        assert!(matches!(teller.submit_turn("   ").await, Err(StoryError::EmptyInput)));
        assert!(teller.turns().await.is_empty());
        assert_eq!(narrator.story_calls(), 0);
    }

    #[tokio::test]
    async fn test_submit_turn_appends_both_turns() {
        let teller = teller(
            MockNarrator::new(vec![MockReply::text(
                "[STORY]The forest hushes.[/STORY][IMAGE]silent forest[/IMAGE]",
            )]),
            MockIllustrator::new(),
        );

        let outcome = teller.submit_turn("I listen").await.unwrap();
        assert!(!outcome.narrative_failed);
        assert!(outcome.illustration_pending);

        let turns = teller.turns().await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].id, outcome.user_turn);
        assert_eq!(turns[1].text, "The forest hushes.");
        assert_eq!(turns[1].directive(), Some("silent forest"));
    }

    #[tokio::test]
    async fn test_auto_illustrate_off_skips_illustration() {
        let illustrator = Arc::new(MockIllustrator::new());
        let teller = StoryTeller::new(
            StoryConfig::default().with_auto_illustrate(false),
            Arc::new(MockNarrator::new(vec![MockReply::text(
                "[STORY]Snow.[/STORY][IMAGE]snowfield[/IMAGE]",
            )])),
            illustrator.clone(),
        )
        .unwrap();

        let outcome = teller.submit_turn("I walk").await.unwrap();
        teller.wait_for_illustrations().await;

        assert!(!outcome.illustration_pending);
        assert_eq!(illustrator.calls(), 0);
        assert!(teller.turns().await[1].illustration.is_none());
    }

    #[tokio::test]
    async fn test_tags_only_reply_counts_as_failure() {
        let teller = teller(
            MockNarrator::new(vec![MockReply::text("[STORY]  [/STORY][IMAGE]x[/IMAGE]")]),
            MockIllustrator::new(),
        );

        let outcome = teller.submit_turn("hello").await.unwrap();
        assert!(outcome.narrative_failed);
        assert_eq!(outcome.narrative, NARRATIVE_FAILURE_MESSAGE);
    }

    #[tokio::test]
    async fn test_busy_flag_clears_after_failure() {
        let teller = teller(
            MockNarrator::new(vec![MockReply::fail("connection refused")]),
            MockIllustrator::new(),
        );

        teller.submit_turn("hello").await.unwrap();
        assert!(!teller.is_busy());
    }

    #[tokio::test]
    async fn test_regenerate_without_assistant_turn() {
        let teller = teller(MockNarrator::new(vec![]), MockIllustrator::new());
        assert_eq!(
            teller.regenerate_last_illustration().await.unwrap(),
            RegenerateOutcome::NoAssistantTurn
        );
    }

    #[tokio::test]
    async fn test_synthesized_directive_prefers_tagged_region() {
        let narrator = MockNarrator::new(vec![MockReply::text("[STORY]A quiet pond.[/STORY]")])
            .with_directive_replies(vec![MockReply::text(
                "<think>keep it short</think>[IMAGE]still pond at dawn[/IMAGE]",
            )]);
        let illustrator = Arc::new(MockIllustrator::new());
        let teller = StoryTeller::new(StoryConfig::default(), Arc::new(narrator), illustrator.clone())
            .unwrap();

        teller.submit_turn("I rest").await.unwrap();
        let outcome = teller.regenerate_last_illustration().await.unwrap();

        assert!(matches!(outcome, RegenerateOutcome::Illustrated { .. }));
        assert_eq!(illustrator.directives(), vec!["still pond at dawn".to_string()]);
        assert_eq!(teller.turns().await[1].directive(), Some("still pond at dawn"));
    }
}
