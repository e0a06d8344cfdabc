//! Free-text model resolution.
//!
//! Users ask for models loosely: "switch to sonnet", "use the fast one",
//! "try gpt4o". [`parse_model_request`] pulls the requested name out of such
//! a sentence and [`FuzzyMatcher`] resolves it to a catalog backend id:
//!
//! | Step | Technique |
//! |------|-----------|
//! | 1 | Exact alias (case-insensitive) |
//! | 2 | Longest alias contained in the input ([`aho_corasick`]) |
//! | 3 | Closest alias within [`MAX_EDIT_DISTANCE`] edits |

use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use regex::Regex;

use crate::catalog::BackendCatalog;

/// Largest Levenshtein distance accepted by step 3.
pub const MAX_EDIT_DISTANCE: usize = 2;

/// Aliases shorter than this are ignored by the substring step so that
/// short tags do not hijack unrelated sentences.
const MIN_SUBSTRING_ALIAS_LEN: usize = 3;

// ---------------------------------------------------------------------------
// FuzzyMatcher
// ---------------------------------------------------------------------------

/// Alias table built from a catalog snapshot.
pub struct FuzzyMatcher {
    /// `(lowercased alias, backend id)` in catalog order.
    aliases: Vec<(String, String)>,
    /// Automaton over the aliases eligible for substring matching.
    automaton: Option<AhoCorasick>,
    /// Maps automaton pattern index back into `aliases`.
    automaton_aliases: Vec<usize>,
}

impl FuzzyMatcher {
    /// Index the id, model part, display name and tags of every backend.
    pub fn from_catalog(catalog: &BackendCatalog) -> Self {
        let mut aliases: Vec<(String, String)> = Vec::new();
        for backend in catalog.backends() {
            let names = [Some(&backend.id), Some(&backend.model), backend.display_name.as_ref()]
                .into_iter()
                .flatten()
                .chain(backend.tags.iter());
            for name in names {
                let alias = name.trim().to_lowercase();
                if alias.is_empty() || aliases.iter().any(|(a, id)| *a == alias && *id == backend.id) {
                    continue;
                }
                aliases.push((alias, backend.id.clone()));
            }
        }

        let automaton_aliases: Vec<usize> = aliases
            .iter()
            .enumerate()
            .filter(|(_, (alias, _))| alias.chars().count() >= MIN_SUBSTRING_ALIAS_LEN)
            .map(|(i, _)| i)
            .collect();
        let patterns: Vec<&str> = automaton_aliases
            .iter()
            .map(|&i| aliases[i].0.as_str())
            .collect();

        let automaton = if patterns.is_empty() {
            None
        } else {
            match AhoCorasick::new(&patterns) {
                Ok(ac) => Some(ac),
                Err(e) => {
                    tracing::error!(error = %e, "failed to build alias automaton");
                    None
                }
            }
        };

        tracing::debug!(aliases = aliases.len(), "fuzzy matcher built");
        Self {
            aliases,
            automaton,
            automaton_aliases,
        }
    }

    /// Resolve free text to a backend id, or `None` when nothing is close.
    pub fn match_backend(&self, text: &str) -> Option<String> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }

        if let Some(id) = self.exact(&needle) {
            tracing::debug!(input = %text, backend = %id, "exact alias match");
            return Some(id);
        }

        if let Some(id) = self.longest_contained(&needle) {
            tracing::debug!(input = %text, backend = %id, "substring alias match");
            return Some(id);
        }

        self.closest(&needle, text)
    }

    /// Like [`match_backend`](Self::match_backend) but the whole phrase must
    /// name the backend: exact alias or a near typo, never an alias buried
    /// in a longer sentence. Used for switch requests detected in prompts.
    pub fn match_whole(&self, text: &str) -> Option<String> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }

        if let Some(id) = self.exact(&needle) {
            tracing::debug!(input = %text, backend = %id, "exact alias match");
            return Some(id);
        }
        self.closest(&needle, text)
    }

    /// Number of indexed aliases.
    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    fn exact(&self, needle: &str) -> Option<String> {
        self.aliases
            .iter()
            .find(|(alias, _)| alias == needle)
            .map(|(_, id)| id.clone())
    }

    /// Nearest alias within [`MAX_EDIT_DISTANCE`]; earliest alias wins ties.
    fn closest(&self, needle: &str, text: &str) -> Option<String> {
        let (distance, id) = self
            .aliases
            .iter()
            .map(|(alias, id)| (levenshtein(needle, alias), id))
            .min_by_key(|(distance, _)| *distance)?;
        if distance <= MAX_EDIT_DISTANCE {
            tracing::debug!(input = %text, backend = %id, distance, "edit distance match");
            Some(id.clone())
        } else {
            None
        }
    }

    /// Longest alias appearing anywhere in `needle`; earliest alias wins ties.
    fn longest_contained(&self, needle: &str) -> Option<String> {
        let ac = self.automaton.as_ref()?;
        let mut best: Option<(usize, usize)> = None; // (alias index, match len)

        for mat in ac.find_overlapping_iter(needle) {
            let len = mat.end() - mat.start();
            let idx = self.automaton_aliases[mat.pattern().as_usize()];
            let better = match best {
                None => true,
                Some((best_idx, best_len)) => len > best_len || (len == best_len && idx < best_idx),
            };
            if better {
                best = Some((idx, len));
            }
        }

        best.map(|(idx, _)| self.aliases[idx].1.clone())
    }
}

/// Classic two-row Levenshtein distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ---------------------------------------------------------------------------
// Switch requests
// ---------------------------------------------------------------------------

static SWITCH_REQUEST: LazyLock<Option<Regex>> = LazyLock::new(|| {
    let pattern = r"(?i)^\s*(?:please\s+|can you\s+|could you\s+)?(?:switch\s+model\s+to|change\s+model\s+to|switch\s+to|change\s+to|use\s+model|use|try|with)\s+(?:the\s+)?(?P<target>.+?)(?:\s+model)?(?:\s+(?:instead|please))?\s*[.!?]*\s*$";
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!(error = %e, "failed to compile switch request pattern");
            None
        }
    }
});

/// Extract the model named in a switch request such as "use sonnet",
/// "switch to gpt-4o please" or "try the fast model".
///
/// Returns `None` for text that is not a switch request.
pub fn parse_model_request(text: &str) -> Option<String> {
    let re = SWITCH_REQUEST.as_ref()?;
    let caps = re.captures(text)?;
    let target = caps.name("target")?.as_str().trim();
    (!target.is_empty()).then(|| target.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
