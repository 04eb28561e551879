//! Conversation Store
//!
//! Keeps a short rolling history of turns for every chat channel the bridge
//! serves. Each history starts with the seed turn and is trimmed as a sliding
//! window so memory per conversation stays bounded.
//!
//! # Locking
//!
//! Two levels of locking keep histories consistent under concurrent events:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ DashMap<conversation id, Arc<Mutex<History>>> │  held briefly: lookup / create
//! └──────────────────────┬───────────────────────┘
//!                        │
//!                 ┌──────┴──────┐
//!                 │ Mutex<History> │  held for one full round trip
//!                 └─────────────┘
//! ```
//!
//! A dispatcher takes the per-conversation lock with [`ConversationStore::lock`],
//! appends the user turn, waits for the backend, and commits the assistant
//! turn before releasing it. Events for the same channel are therefore
//! serialized, while different channels proceed in parallel.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Window size used when configuration does not provide one
pub const DEFAULT_WINDOW_SIZE: usize = 8;

/// Seed text used when configuration does not provide one
pub const DEFAULT_SEED_PROMPT: &str = "You are a professional assistant";

/// Who produced a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The fixed seed instruction
    System,
    /// A chat participant
    User,
    /// The model
    Assistant,
}

impl Role {
    /// Lowercase label, as used by role-tagged backends
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One utterance in a conversation
///
/// Turns are never edited after creation; streamed text is accumulated
/// elsewhere and only becomes a `Turn` once it is final.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    text: String,
}

impl Turn {
    /// Create a turn
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    /// Who spoke
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// What was said
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Ordered turns of a single conversation, seed first
#[derive(Clone, Debug)]
pub struct ConversationHistory {
    seed: Turn,
    turns: VecDeque<Turn>,
    window: usize,
}

impl ConversationHistory {
    /// Start a history containing only the seed turn
    pub fn new(seed: impl Into<String>, window: usize) -> Self {
        Self {
            seed: Turn::new(Role::System, seed),
            turns: VecDeque::with_capacity(window + 1),
            window,
        }
    }

    /// Append a turn, evicting the oldest non-seed turn first if the history
    /// is already longer than the window.
    ///
    /// Eviction drops one turn per call, so the history holds at most the seed
    /// plus `window` turns once it is full.
    pub fn append(&mut self, role: Role, text: impl Into<String>) -> Vec<Turn> {
        if self.len() > self.window && !self.turns.is_empty() {
            self.turns.pop_front();
        }
        self.turns.push_back(Turn::new(role, text));
        self.snapshot()
    }

    /// Copy of the full ordered history
    #[must_use]
    pub fn snapshot(&self) -> Vec<Turn> {
        std::iter::once(self.seed.clone())
            .chain(self.turns.iter().cloned())
            .collect()
    }

    /// Number of turns, seed included
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.turns.len()
    }

    /// A history always holds its seed, so it is never empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The seed turn
    #[must_use]
    pub fn seed(&self) -> &Turn {
        &self.seed
    }
}

/// Exclusive access to one conversation for the duration of a round trip
pub struct ConversationGuard {
    conversation_id: String,
    history: OwnedMutexGuard<ConversationHistory>,
}

impl ConversationGuard {
    /// Conversation this guard belongs to
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Append a turn and return the resulting history
    pub fn append(&mut self, role: Role, text: impl Into<String>) -> Vec<Turn> {
        let turns = self.history.append(role, text);
        tracing::debug!(
            conversation_id = %self.conversation_id,
            role = role.as_str(),
            turns = turns.len(),
            "Appended turn"
        );
        turns
    }

    /// Current history without modifying it
    #[must_use]
    pub fn snapshot(&self) -> Vec<Turn> {
        self.history.snapshot()
    }
}

/// Histories for every conversation the bridge has seen
pub struct ConversationStore {
    seed: String,
    window: usize,
    conversations: DashMap<String, Arc<Mutex<ConversationHistory>>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_SEED_PROMPT, DEFAULT_WINDOW_SIZE)
    }
}

impl ConversationStore {
    /// Create an empty store
    ///
    /// `window` is the number of non-seed turns kept per conversation.
    pub fn new(seed: impl Into<String>, window: usize) -> Self {
        Self {
            seed: seed.into(),
            window,
            conversations: DashMap::new(),
        }
    }

    /// Seed text new conversations start with
    #[must_use]
    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Configured window size
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }

    /// Number of conversations seen so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether no conversation has been created yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Look up or lazily create the entry for a conversation.
    ///
    /// The map shard lock is released before the caller awaits the
    /// per-conversation mutex.
    fn entry(&self, conversation_id: &str) -> Arc<Mutex<ConversationHistory>> {
        self.conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                tracing::info!(conversation_id = %conversation_id, "Created conversation");
                Arc::new(Mutex::new(ConversationHistory::new(
                    self.seed.clone(),
                    self.window,
                )))
            })
            .clone()
    }

    /// Take the per-conversation lock
    pub async fn lock(&self, conversation_id: &str) -> ConversationGuard {
        let history = self.entry(conversation_id).lock_owned().await;
        ConversationGuard {
            conversation_id: conversation_id.to_string(),
            history,
        }
    }

    /// Append a single turn and return the resulting history
    pub async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        text: impl Into<String>,
    ) -> Vec<Turn> {
        self.lock(conversation_id).await.append(role, text)
    }

    /// Current history of a conversation, if it exists
    pub async fn history(&self, conversation_id: &str) -> Option<Vec<Turn>> {
        let entry = self.conversations.get(conversation_id)?.clone();
        let history = entry.lock().await;
        Some(history.snapshot())
    }
}
