//! Conversation store.
//!
//! [`ConversationLog`] is the ordered turn log plus the runtime-adjustable
//! settings. [`spawn_store`] moves a log into its own task and hands back a
//! cloneable [`StoreHandle`]; every operation is one message, so appends,
//! patches and resets are applied atomically and in arrival order.
//!
//! Patching a turn that no longer exists (the story was reset while an
//! illustration was in flight) is a silent no-op.

use crate::config::StoryConfig;
use crate::id::TurnId;
use crate::turn::{HistoryEntry, Turn, TurnPatch};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const COMMAND_BUFFER: usize = 64;

/// Ordered, append/patch-only log of turns.
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    turns: Vec<Turn>,
    config: StoryConfig,
}

impl ConversationLog {
    pub fn new(config: StoryConfig) -> Self {
        Self {
            turns: Vec::new(),
            config,
        }
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Apply `patch` to the turn with `id`. Returns `false` if there is no
    /// such turn; the log is left untouched.
    pub fn patch(&mut self, id: TurnId, patch: TurnPatch) -> bool {
        match self.turns.iter_mut().find(|t| t.id == id) {
            Some(turn) => {
                turn.apply(patch);
                true
            }
            None => false,
        }
    }

    /// Discard every turn. Settings are kept.
    pub fn reset(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Speaker and text of every turn, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.turns.iter().map(Turn::to_history).collect()
    }

    pub fn config(&self) -> &StoryConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut StoryConfig {
        &mut self.config
    }
}

/// A message to the store task.
#[derive(Debug)]
pub enum StoreCommand {
    Append(Turn, oneshot::Sender<()>),
    Patch {
        id: TurnId,
        patch: TurnPatch,
        reply: oneshot::Sender<bool>,
    },
    Reset(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<Vec<Turn>>),
    History(oneshot::Sender<Vec<HistoryEntry>>),
    Config(oneshot::Sender<StoryConfig>),
    SetGuidingInstructions(String),
    SetAutoIllustrate(bool),
}

/// Cloneable handle to a running store task.
///
/// If the task has stopped, calls log a warning and behave as if the store
/// were empty.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    commands: mpsc::Sender<StoreCommand>,
}

/// Spawn a store task owning an empty log.
///
/// Must be called from within a tokio runtime. The task ends when every
/// handle has been dropped.
pub fn spawn_store(config: StoryConfig) -> StoreHandle {
    let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
    tokio::spawn(store_loop(ConversationLog::new(config), receiver));
    StoreHandle { commands }
}

async fn store_loop(mut log: ConversationLog, mut commands: mpsc::Receiver<StoreCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            StoreCommand::Append(turn, done) => {
                debug!(turn = %turn.id, speaker = turn.speaker.as_str(), "append");
                log.append(turn);
                let _ = done.send(());
            }
            StoreCommand::Patch { id, patch, reply } => {
                let applied = log.patch(id, patch);
                if !applied {
                    debug!(turn = %id, "patch target no longer exists, ignoring");
                }
                let _ = reply.send(applied);
            }
            StoreCommand::Reset(done) => {
                debug!(discarded = log.len(), "reset");
                log.reset();
                let _ = done.send(());
            }
            StoreCommand::Snapshot(reply) => {
                let _ = reply.send(log.turns().to_vec());
            }
            StoreCommand::History(reply) => {
                let _ = reply.send(log.history());
            }
            StoreCommand::Config(reply) => {
                let _ = reply.send(log.config().clone());
            }
            StoreCommand::SetGuidingInstructions(instructions) => {
                log.config_mut().guiding_instructions = instructions;
            }
            StoreCommand::SetAutoIllustrate(enabled) => {
                log.config_mut().auto_illustrate = enabled;
            }
        }
    }
    debug!("conversation store closed");
}

impl StoreHandle {
    async fn send(&self, command: StoreCommand) -> bool {
        if self.commands.send(command).await.is_err() {
            warn!("conversation store is no longer running");
            return false;
        }
        true
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> StoreCommand) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if !self.send(make(reply)).await {
            return None;
        }
        response.await.ok()
    }

    /// Append a turn; returns once it is visible to every handle.
    pub async fn append(&self, turn: Turn) {
        self.request(|done| StoreCommand::Append(turn, done)).await;
    }

    /// Patch a turn by id. `false` means the turn no longer exists.
    pub async fn patch(&self, id: TurnId, patch: TurnPatch) -> bool {
        self.request(|reply| StoreCommand::Patch { id, patch, reply })
            .await
            .unwrap_or(false)
    }

    /// Discard every turn.
    pub async fn reset(&self) {
        self.request(StoreCommand::Reset).await;
    }

    /// Copy of every turn, oldest first.
    pub async fn snapshot(&self) -> Vec<Turn> {
        self.request(StoreCommand::Snapshot).await.unwrap_or_default()
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.request(StoreCommand::History).await.unwrap_or_default()
    }

    pub async fn config(&self) -> StoryConfig {
        self.request(StoreCommand::Config).await.unwrap_or_default()
    }

    pub async fn set_guiding_instructions(&self, instructions: impl Into<String>) {
        self.send(StoreCommand::SetGuidingInstructions(instructions.into()))
            .await;
    }

    pub async fn set_auto_illustrate(&self, enabled: bool) {
        self.send(StoreCommand::SetAutoIllustrate(enabled)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{IllustrationRef, Speaker};

    fn patch(url: &str) -> TurnPatch {
        TurnPatch::illustration(IllustrationRef::new(url))
    }

    #[test]
    fn test_log_append_keeps_order() {
        let mut log = ConversationLog::default();
        log.append(Turn::user("I light a torch"));
        log.append(Turn::assistant("Shadows retreat.", "torchlight in a cave"));

        let speakers: Vec<_> = log.turns().iter().map(|t| t.speaker).collect();
        assert_eq!(speakers, vec![Speaker::User, Speaker::Assistant]);
        assert_eq!(log.history()[1].text, "Shadows retreat.");
    }

    #[test]
    fn test_log_patch_by_id() {
        let mut log = ConversationLog::default();
        let turn = Turn::assistant("A raven lands.", "raven on a branch");
        let id = turn.id;
        log.append(turn);

        assert!(log.patch(id, patch("http://img/raven.png")));
        assert_eq!(
            log.turns()[0].illustration,
            Some(IllustrationRef::new("http://img/raven.png"))
        );
    }

    #[test]
    fn test_log_patch_unknown_id_is_noop() {
        let mut log = ConversationLog::default();
        log.append(Turn::user("hello"));
        let before = log.turns().to_vec();

        assert!(!log.patch(TurnId::new(), patch("http://img/x.png")));
        assert_eq!(log.turns(), before.as_slice());
    }

    #[test]
    fn test_log_reset_keeps_config() {
        let mut log = ConversationLog::new(StoryConfig::new().with_auto_illustrate(false));
        log.append(Turn::user("hello"));
        log.reset();

        assert!(log.is_empty());
        assert!(!log.config().auto_illustrate);
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let store = spawn_store(StoryConfig::default());
        let turn = Turn::assistant("The tide turns.", "");
        let id = turn.id;

        store.append(Turn::user("I wait")).await;
        store.append(turn).await;
        assert!(store.patch(id, patch("http://img/tide.png")).await);

        let turns = store.snapshot().await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].illustration.as_ref().unwrap().as_str(), "http://img/tide.png");
        assert_eq!(store.history().await[0].text, "I wait");
    }

    #[tokio::test]
    async fn test_handle_stale_patch_after_reset() {
        let store = spawn_store(StoryConfig::default());
        let turn = Turn::assistant("The bridge collapses.", "collapsing bridge");
        let id = turn.id;
        store.append(turn).await;

        store.reset().await;
        assert!(!store.patch(id, patch("http://img/late.png")).await);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_handle_settings() {
        let store = spawn_store(StoryConfig::default());
        store.set_guiding_instructions("Write in the style of a fable.").await;
        store.set_auto_illustrate(false).await;

        let config = store.config().await;
        assert_eq!(config.guiding_instructions, "Write in the style of a fable.");
        assert!(!config.auto_illustrate);
    }

    #[tokio::test]
    async fn test_handles_share_one_log() {
        let store = spawn_store(StoryConfig::default());
        let other = store.clone();

        store.append(Turn::user("first")).await;
        other.append(Turn::user("second")).await;

        let texts: Vec<_> = store.snapshot().await.into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }
}
