//! Backend selection.
//!
//! The [`ModelRouter`] turns a conversation history into a backend id:
//!
//! 1. classify the history into a [`TaskCategory`],
//! 2. walk the category route (primary, then fallbacks),
//! 3. walk the global default route,
//! 4. give up with `None`.
//!
//! A candidate is skipped when it is unknown, inactive, missing
//! credentials, cooling down, or excluded by the caller. Each id is tested
//! at most once per selection.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use steward_store::Message;

use crate::catalog::BackendCatalog;
use crate::classifier::{KeywordClassifier, TaskCategory, TaskClassifier};
use crate::cooldown::{CooldownPolicy, CooldownTracker};

// ---------------------------------------------------------------------------
// Usability
// ---------------------------------------------------------------------------

/// Why a backend can or cannot be selected right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usability {
    Usable,
    Unknown,
    Inactive,
    MissingCredentials,
    Excluded,
    CoolingDown(Duration),
}

impl Usability {
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }
}

impl fmt::Display for Usability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usable => f.write_str("usable"),
            Self::Unknown => f.write_str("unknown backend"),
            Self::Inactive => f.write_str("inactive"),
            Self::MissingCredentials => f.write_str("missing credentials"),
            Self::Excluded => f.write_str("excluded"),
            Self::CoolingDown(left) => write!(f, "cooling down ({}s left)", left.as_secs()),
        }
    }
}

// ---------------------------------------------------------------------------
// ModelRouter
// ---------------------------------------------------------------------------

/// Picks a backend for a history.
///
/// Safe to share across tasks; selection takes a read lock on the catalog
/// snapshot and never blocks on I/O.
pub struct ModelRouter {
    catalog: RwLock<Arc<BackendCatalog>>,
    cooldowns: CooldownTracker,
    classifier: Arc<dyn TaskClassifier>,
}

impl ModelRouter {
    /// Router with the default keyword classifier.
    pub fn new(catalog: BackendCatalog, policy: CooldownPolicy) -> Self {
        Self {
            catalog: RwLock::new(Arc::new(catalog)),
            cooldowns: CooldownTracker::new(policy),
            classifier: Arc::new(KeywordClassifier::new()),
        }
    }

    /// Replace the classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn TaskClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<BackendCatalog> {
        Arc::clone(&self.catalog.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a new catalog. In-flight selections keep the old snapshot;
    /// cooldowns survive the swap.
    pub fn reload(&self, catalog: BackendCatalog) {
        let backends = catalog.len();
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
        tracing::info!(backends, "backend catalog reloaded");
    }

    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    pub fn classify(&self, history: &[Message]) -> TaskCategory {
        self.classifier.classify(history)
    }

    pub fn select(&self, history: &[Message]) -> Option<String> {
        self.select_with_exclusions(history, &HashSet::new())
    }

    pub fn select_with_exclusions(
        &self,
        history: &[Message],
        excluded: &HashSet<String>,
    ) -> Option<String> {
        let category = self.classify(history);
        self.select_for(category, excluded)
    }

    /// Selection for an already-known category.
    pub fn select_for(&self, category: TaskCategory, excluded: &HashSet<String>) -> Option<String> {
        let catalog = self.catalog();
        let mut tested: HashSet<&str> = HashSet::new();

        let candidates = catalog
            .route_for(category)
            .into_iter()
            .chain(catalog.default_route())
            .flat_map(|route| route.candidates());

        for id in candidates {
            if !tested.insert(id) {
                continue;
            }
            match self.usability_in(&catalog, id, excluded) {
                Usability::Usable => {
                    tracing::debug!(category = %category, backend = %id, "backend selected");
                    return Some(id.to_string());
                }
                reason => {
                    tracing::debug!(backend = %id, reason = %reason, "candidate skipped");
                }
            }
        }

        tracing::warn!(category = %category, tested = tested.len(), "no backend available");
        None
    }

    /// Whether `id` could be selected right now, and if not, why.
    pub fn usability(&self, id: &str, excluded: &HashSet<String>) -> Usability {
        self.usability_in(&self.catalog(), id, excluded)
    }

    fn usability_in(
        &self,
        catalog: &BackendCatalog,
        id: &str,
        excluded: &HashSet<String>,
    ) -> Usability {
        let Some(entry) = catalog.get(id) else {
            return Usability::Unknown;
        };
        if !entry.active {
            return Usability::Inactive;
        }
        if !entry.credentials {
            return Usability::MissingCredentials;
        }
        if excluded.contains(id) {
            return Usability::Excluded;
        }
        let left = self.cooldowns.remaining(id);
        if !left.is_zero() {
            return Usability::CoolingDown(left);
        }
        Usability::Usable
    }

    /// Record a failure; returns the quarantine window.
    pub fn mark_failed(&self, backend_id: &str) -> Duration {
        self.cooldowns.mark_failed(backend_id)
    }

    /// A completed turn ends the backend's failure streak.
    pub fn mark_succeeded(&self, backend_id: &str) {
        self.cooldowns.clear(backend_id);
    }

    pub fn clear_failed(&self) {
        self.cooldowns.clear_all();
    }

    pub fn cooldown_remaining(&self, backend_id: &str) -> Duration {
        self.cooldowns.remaining(backend_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BackendEntry, Route};

    fn entry(id: &str) -> BackendEntry {
        BackendEntry::new(id).unwrap()
    }

    fn router() -> ModelRouter {
        let catalog = BackendCatalog::builder()
            .backend(entry("anthropic/opus"))
            .backend(entry("anthropic/sonnet"))
            .backend(entry("openai/gpt-4o"))
            .backend(entry("google/gemini").without_credentials())
            .backend(entry("local/llama3").inactive())
            .route(
                TaskCategory::Reasoning,
                Route::new("anthropic/opus").with_fallback("anthropic/sonnet"),
            )
            .route(TaskCategory::Vision, Route::new("google/gemini"))
            .default_route(Route::new("openai/gpt-4o").with_fallback("local/llama3"))
            .build()
            .unwrap();
        ModelRouter::new(catalog, CooldownPolicy::default())
    }

    fn ask(text: &str) -> Vec<Message> {
        vec![Message::user(text)]
    }

    #[test]
    fn primary_route_for_category() {
        let router = router();
        assert_eq!(
            router.select(&ask("prove this step by step")).as_deref(),
            Some("anthropic/opus")
        );
        assert_eq!(router.select(&ask("hello")).as_deref(), Some("openai/gpt-4o"));
    }

    #[test]
    fn cooling_primary_falls_back_in_order() {
        let router = router();
        router.mark_failed("anthropic/opus");
        assert_eq!(
            router.select(&ask("prove it")).as_deref(),
            Some("anthropic/sonnet")
        );

        router.mark_failed("anthropic/sonnet");
        assert_eq!(router.select(&ask("prove it")).as_deref(), Some("openai/gpt-4o"));
    }

    #[test]
    fn unconfigured_primary_uses_default_route() {
        let router = router();
        let history = vec![Message::user("what is this? <image>")];
        assert_eq!(router.classify(&history), TaskCategory::Vision);
        assert_eq!(router.select(&history).as_deref(), Some("openai/gpt-4o"));
    }

    #[test]
    fn exclusions_are_honoured() {
        let router = router();
        let excluded: HashSet<String> = ["openai/gpt-4o".to_string()].into();
        assert_eq!(router.select_with_exclusions(&ask("hi"), &excluded), None);
        assert_eq!(
            router.usability("openai/gpt-4o", &excluded),
            Usability::Excluded
        );
    }

    #[test]
    fn exhausted_routes_yield_none_and_clear_restores() {
        let router = router();
        router.mark_failed("openai/gpt-4o");
        assert_eq!(router.select(&ask("hi")), None);

        router.clear_failed();
        assert!(router.cooldown_remaining("openai/gpt-4o").is_zero());
        assert_eq!(router.select(&ask("hi")).as_deref(), Some("openai/gpt-4o"));
    }

    #[test]
    fn success_ends_failure_streak() {
        let router = router();
        router.mark_failed("anthropic/opus");
        router.mark_failed("anthropic/opus");
        assert_eq!(
            router.cooldowns().state("anthropic/opus").unwrap().consecutive_failures,
            2
        );

        router.mark_succeeded("anthropic/opus");
        assert!(router.cooldowns().state("anthropic/opus").is_none());
        assert!(router.cooldown_remaining("anthropic/opus").is_zero());

        let window = router.mark_failed("anthropic/opus");
        assert_eq!(window, CooldownPolicy::default().window(1));
        assert_eq!(
            router.cooldowns().state("anthropic/opus").unwrap().consecutive_failures,
            1
        );
    }

    #[test]
    fn usability_reports_reason() {
        let router = router();
        let none = HashSet::new();
        assert_eq!(router.usability("google/gemini", &none), Usability::MissingCredentials);
        assert_eq!(router.usability("local/llama3", &none), Usability::Inactive);
        assert_eq!(router.usability("nobody/none", &none), Usability::Unknown);
        router.mark_failed("anthropic/opus");
        assert!(matches!(
            router.usability("anthropic/opus", &none),
            Usability::CoolingDown(_)
        ));
    }

    #[test]
    fn reload_swaps_catalog_and_keeps_cooldowns() {
        let router = router();
        router.mark_failed("anthropic/opus");

        let next = BackendCatalog::builder()
            .backend(entry("anthropic/opus"))
            .backend(entry("mistral/large"))
            .default_route(Route::new("anthropic/opus").with_fallback("mistral/large"))
            .build()
            .unwrap();
        router.reload(next);

        assert_eq!(router.catalog().len(), 2);
        assert_eq!(router.select(&ask("hi")).as_deref(), Some("mistral/large"));
    }

    #[test]
    fn custom_classifier_is_used() {
        struct AlwaysCode;
        impl TaskClassifier for AlwaysCode {
            fn classify(&self, _: &[Message]) -> TaskCategory {
                TaskCategory::Code
            }
        }

        let router = router().with_classifier(Arc::new(AlwaysCode));
        assert_eq!(router.classify(&ask("prove it")), TaskCategory::Code);
    }

    #[test]
    fn empty_catalog_selects_nothing() {
        let router = ModelRouter::new(BackendCatalog::default(), CooldownPolicy::default());
        assert_eq!(router.select(&[]), None);
    }
}
