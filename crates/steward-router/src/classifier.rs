//! Task classification.
//!
//! Maps a conversation history to a [`TaskCategory`] so the router can pick
//! a backend suited to the work. The default [`KeywordClassifier`] is a pure
//! function of the history: modality markers first, then keyword hits in
//! the most recent user message.

use std::fmt;
use std::str::FromStr;

use aho_corasick::AhoCorasick;
use serde::{Deserialize, Serialize};
use steward_store::{AttachmentKind, Message, Role};

use crate::error::RouterError;

// ---------------------------------------------------------------------------
// TaskCategory
// ---------------------------------------------------------------------------

/// Kind of work a turn represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    Vision,
    Audio,
    Reasoning,
    Code,
    General,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 5] = [
        Self::Vision,
        Self::Audio,
        Self::Reasoning,
        Self::Code,
        Self::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Audio => "audio",
            Self::Reasoning => "reasoning",
            Self::Code => "code",
            Self::General => "general",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCategory {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RouterError::UnknownCategory {
                name: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Classifier trait
// ---------------------------------------------------------------------------

/// Pluggable history classifier.
///
/// Implementations must be deterministic and must not panic on any input,
/// including an empty history.
pub trait TaskClassifier: Send + Sync {
    fn classify(&self, history: &[Message]) -> TaskCategory;
}

// ---------------------------------------------------------------------------
// Keyword sets
// ---------------------------------------------------------------------------

const IMAGE_MARKERS: &[&str] = &["[image:", "data:image/", "<image>"];
const AUDIO_MARKERS: &[&str] = &["[audio:", "data:audio/", "<audio>"];

const REASONING_KEYWORDS: &[&str] = &[
    "step by step",
    "think through",
    "reason about",
    "reasoning",
    "prove",
    "proof",
    "derive",
    "analyze",
    "analyse",
    "trade-off",
    "tradeoff",
    "pros and cons",
    "explain why",
    "logic puzzle",
    "calculate",
];

const AUDIO_KEYWORDS: &[&str] = &[
    "transcribe",
    "transcript",
    "voice memo",
    "voice message",
    "podcast",
    "audio",
    "speech to text",
    "text to speech",
];

const CODE_KEYWORDS: &[&str] = &[
    "```",
    "code",
    "function",
    "compile",
    "stack trace",
    "traceback",
    "debug",
    "refactor",
    "unit test",
    "regex",
    "python",
    "javascript",
    "typescript",
    "golang",
    "rustc",
    "cargo",
    "sql",
];

/// Keyword overrides loaded from the `[classifier]` config section.
///
/// A `None` list keeps the built-in set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub reasoning_keywords: Option<Vec<String>>,
    pub audio_keywords: Option<Vec<String>>,
    pub code_keywords: Option<Vec<String>>,
}

/// One compiled keyword automaton. Matches against lowercased text.
struct KeywordSet {
    automaton: Option<AhoCorasick>,
}

impl KeywordSet {
    fn new<S: AsRef<str>>(name: &'static str, keywords: &[S]) -> Self {
        let lowered: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if lowered.is_empty() {
            return Self { automaton: None };
        }
        match AhoCorasick::new(&lowered) {
            Ok(ac) => {
                tracing::trace!(set = name, count = lowered.len(), "keyword automaton built");
                Self {
                    automaton: Some(ac),
                }
            }
            Err(e) => {
                tracing::error!(set = name, error = %e, "failed to build keyword automaton");
                Self { automaton: None }
            }
        }
    }

    fn hits(&self, lowered: &str) -> bool {
        self.automaton
            .as_ref()
            .is_some_and(|ac| ac.is_match(lowered))
    }
}

// ---------------------------------------------------------------------------
// KeywordClassifier
// ---------------------------------------------------------------------------

/// Default classifier.
///
/// 1. Any user message carrying an image → [`TaskCategory::Vision`].
/// 2. Any user message carrying audio → [`TaskCategory::Audio`].
/// 3. Keyword hits in the latest non-empty user message, checked in the
///    order reasoning, audio, code.
/// 4. [`TaskCategory::General`].
pub struct KeywordClassifier {
    image_markers: KeywordSet,
    audio_markers: KeywordSet,
    reasoning: KeywordSet,
    audio: KeywordSet,
    code: KeywordSet,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        fn pick<'a>(custom: &'a Option<Vec<String>>, builtin: &'a [&'a str]) -> Vec<&'a str> {
            match custom {
                Some(list) => list.iter().map(String::as_str).collect(),
                None => builtin.to_vec(),
            }
        }

        Self {
            image_markers: KeywordSet::new("image_markers", IMAGE_MARKERS),
            audio_markers: KeywordSet::new("audio_markers", AUDIO_MARKERS),
            reasoning: KeywordSet::new(
                "reasoning",
                &pick(&config.reasoning_keywords, REASONING_KEYWORDS),
            ),
            audio: KeywordSet::new("audio", &pick(&config.audio_keywords, AUDIO_KEYWORDS)),
            code: KeywordSet::new("code", &pick(&config.code_keywords, CODE_KEYWORDS)),
        }
    }

    fn carries(&self, msg: &Message, kind: AttachmentKind, markers: &KeywordSet) -> bool {
        msg.attachments.iter().any(|a| a.kind == kind)
            || markers.hits(&msg.content.to_lowercase())
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskClassifier for KeywordClassifier {
    fn classify(&self, history: &[Message]) -> TaskCategory {
        let user_messages = || history.iter().filter(|m| m.role == Role::User);

        if user_messages().any(|m| self.carries(m, AttachmentKind::Image, &self.image_markers)) {
            return TaskCategory::Vision;
        }
        if user_messages().any(|m| self.carries(m, AttachmentKind::Audio, &self.audio_markers)) {
            return TaskCategory::Audio;
        }

        let Some(latest) = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User && !m.content.trim().is_empty())
        else {
            return TaskCategory::General;
        };

        let lowered = latest.content.to_lowercase();
        if self.reasoning.hits(&lowered) {
            TaskCategory::Reasoning
        } else if self.audio.hits(&lowered) {
            TaskCategory::Audio
        } else if self.code.hits(&lowered) {
            TaskCategory::Code
        } else {
            TaskCategory::General
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
