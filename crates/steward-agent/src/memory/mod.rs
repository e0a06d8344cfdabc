//! Memory extraction contracts.
//!
//! After a run completes, the runner hands the conversation to a
//! [`MemoryQueue`]. A worker asks a [`MemoryExtractor`] for durable facts
//! and writes them through a [`MemoryStore`]. Every failure along the way
//! is logged and swallowed; memory never affects a run's outcome.

pub mod queue;

use async_trait::async_trait;
use steward_store::{FactCategory, FactStore, Message, NewFact, Role};

use crate::error::Result;

pub use queue::{MemoryJob, MemoryQueue, MemoryQueueConfig, MemoryQueueHandle, MemoryStats};

/// A fact worth remembering beyond the current conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub category: FactCategory,
    pub content: String,
    /// 0.0 to 1.0.
    pub importance: f64,
    pub session_id: Option<String>,
}

impl MemoryEntry {
    pub fn new(category: FactCategory, content: impl Into<String>, importance: f64) -> Self {
        Self {
            category,
            content: content.into(),
            importance,
            session_id: None,
        }
    }

    pub fn in_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Turns recent messages into facts.
#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    async fn extract(
        &self,
        session_id: Option<&str>,
        messages: &[Message],
    ) -> Result<Vec<MemoryEntry>>;
}

/// Persists extracted facts.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Returns the stored id.
    async fn save_memory(&self, entry: MemoryEntry) -> Result<i64>;

    /// Save everything one job extracted. Returns how many were saved.
    async fn save_memories(&self, entries: Vec<MemoryEntry>) -> Result<usize> {
        let mut saved = 0;
        for entry in entries {
            self.save_memory(entry).await?;
            saved += 1;
        }
        Ok(saved)
    }
}

fn to_fact(entry: MemoryEntry) -> NewFact {
    let fact = NewFact::new(entry.category, entry.content, entry.importance);
    match entry.session_id {
        Some(session_id) => fact.in_session(session_id),
        None => fact,
    }
}

#[async_trait]
impl MemoryStore for FactStore {
    async fn save_memory(&self, entry: MemoryEntry) -> Result<i64> {
        Ok(self.insert(to_fact(entry)).await?)
    }

    /// One transaction per job.
    async fn save_memories(&self, entries: Vec<MemoryEntry>) -> Result<usize> {
        Ok(self
            .insert_many(entries.into_iter().map(to_fact).collect())
            .await?)
    }
}

// ---------------------------------------------------------------------------
// Heuristic extractor
// ---------------------------------------------------------------------------

const PREFERENCE_CUES: &[&str] = &[
    "i prefer",
    "i like",
    "i don't like",
    "i hate",
    "please always",
    "please never",
];
const KNOWLEDGE_CUES: &[&str] = &[
    "remember that",
    "my name is",
    "i work at",
    "i live in",
    "note that",
];
const PATTERN_CUES: &[&str] = &["every time", "usually", "as always", "like last time"];

/// Phrase-cue extractor over user messages. No backend call involved.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractor;

impl HeuristicExtractor {
    fn classify(text: &str) -> Option<(FactCategory, f64)> {
        let lowered = text.to_lowercase();
        let has = |cues: &[&str]| cues.iter().any(|c| lowered.contains(c));
        if has(PREFERENCE_CUES) {
            Some((FactCategory::Preference, 0.7))
        } else if has(KNOWLEDGE_CUES) {
            Some((FactCategory::Knowledge, 0.8))
        } else if has(PATTERN_CUES) {
            Some((FactCategory::Pattern, 0.6))
        } else {
            None
        }
    }
}

#[async_trait]
impl MemoryExtractor for HeuristicExtractor {
    async fn extract(
        &self,
        session_id: Option<&str>,
        messages: &[Message],
    ) -> Result<Vec<MemoryEntry>> {
        let mut entries: Vec<MemoryEntry> = Vec::new();
        for msg in messages.iter().filter(|m| m.role == Role::User) {
            let text = msg.content.trim();
            let Some((category, importance)) = Self::classify(text) else {
                continue;
            };
            if entries.iter().any(|e| e.content == text) {
                continue;
            }
            entries.push(
                MemoryEntry::new(category, text, importance)
                    .in_session(session_id.map(str::to_string)),
            );
        }
        Ok(entries)
    }
}
