//! Immutable backend catalog.
//!
//! A [`BackendCatalog`] is a snapshot of everything routing needs to know
//! about the configured backends: which exist, whether their credentials
//! are present, whether they are switched on, what they can do, and the
//! per-category routes. It is built once from configuration and replaced
//! wholesale on reload; nothing mutates it in place.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::classifier::TaskCategory;
use crate::error::{Result, RouterError};

// ---------------------------------------------------------------------------
// Configuration shapes
// ---------------------------------------------------------------------------

/// Optional features a backend supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub vision: bool,
    pub audio: bool,
    /// Accepts a request for extended reasoning / thinking output.
    pub extended_reasoning: bool,
}

/// One `[[backends]]` entry as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `provider/model`.
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Base URL for self-hosted backends.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Local command for CLI-driven backends.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Free-form aliases such as `fast` or `cheap`.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

fn default_true() -> bool {
    true
}

/// A primary backend plus ordered fallbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl Route {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            fallbacks: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, id: impl Into<String>) -> Self {
        self.fallbacks.push(id.into());
        self
    }

    /// Primary first, then fallbacks in order.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

/// Route table key for the global default route.
pub const DEFAULT_ROUTE_KEY: &str = "default";

// ---------------------------------------------------------------------------
// BackendEntry
// ---------------------------------------------------------------------------

/// A backend as the router sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendEntry {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub display_name: Option<String>,
    pub tags: Vec<String>,
    pub active: bool,
    /// Key, endpoint or command is available. The secret itself is not kept.
    pub credentials: bool,
    pub capabilities: Capabilities,
}

impl BackendEntry {
    /// An active backend with credentials present.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let (provider, model) = split_id(&id)?;
        Ok(Self {
            provider,
            model,
            id,
            display_name: None,
            tags: Vec::new(),
            active: true,
            credentials: true,
            capabilities: Capabilities::default(),
        })
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn without_credentials(mut self) -> Self {
        self.credentials = false;
        self
    }

    /// Configured and switched on. Cooldowns are tracked separately.
    pub fn is_configured(&self) -> bool {
        self.active && self.credentials
    }

    /// Resolve a config entry, checking credential presence through `env`.
    ///
    /// A named `api_key_env` must resolve to a non-empty value. Without one,
    /// an endpoint or command counts as configured.
    fn from_config(cfg: &BackendConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let credentials = match &cfg.api_key_env {
            Some(var) => env(var).is_some_and(|v| !v.trim().is_empty()),
            None => cfg.endpoint.is_some() || cfg.command.is_some(),
        };
        if !credentials {
            tracing::debug!(backend = %cfg.id, "backend has no credentials configured");
        }

        let mut entry = Self::new(cfg.id.clone())?;
        entry.display_name = cfg.display_name.clone();
        entry.tags = cfg.tags.clone();
        entry.active = cfg.active;
        entry.credentials = credentials;
        entry.capabilities = cfg.capabilities;
        Ok(entry)
    }
}

/// Split `provider/model`. The model part may itself contain slashes.
pub fn split_id(id: &str) -> Result<(String, String)> {
    match id.split_once('/') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            Ok((provider.to_string(), model.to_string()))
        }
        _ => Err(RouterError::InvalidBackendId {
            id: id.to_string(),
            reason: "expected provider/model".into(),
        }),
    }
}

// ---------------------------------------------------------------------------
// BackendCatalog
// ---------------------------------------------------------------------------

/// Immutable snapshot of backends and routes.
#[derive(Debug, Clone, Default)]
pub struct BackendCatalog {
    backends: Vec<BackendEntry>,
    index: HashMap<String, usize>,
    routes: HashMap<TaskCategory, Route>,
    default_route: Option<Route>,
}

impl BackendCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Build from config, resolving credentials from the process environment.
    pub fn from_config(backends: &[BackendConfig], routes: &BTreeMap<String, Route>) -> Result<Self> {
        Self::from_config_with(backends, routes, |var| std::env::var(var).ok())
    }

    /// Build from config with a custom environment lookup.
    pub fn from_config_with<F>(
        backends: &[BackendConfig],
        routes: &BTreeMap<String, Route>,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();
        for cfg in backends {
            builder = builder.backend(BackendEntry::from_config(cfg, &env)?);
        }
        for (key, route) in routes {
            if key.eq_ignore_ascii_case(DEFAULT_ROUTE_KEY) {
                builder = builder.default_route(route.clone());
            } else {
                builder = builder.route(key.parse()?, route.clone());
            }
        }
        builder.build()
    }

    /// Backends in configuration order.
    pub fn backends(&self) -> &[BackendEntry] {
        &self.backends
    }

    pub fn get(&self, id: &str) -> Option<&BackendEntry> {
        self.index.get(id).map(|&i| &self.backends[i])
    }

    pub fn route_for(&self, category: TaskCategory) -> Option<&Route> {
        self.routes.get(&category)
    }

    pub fn default_route(&self) -> Option<&Route> {
        self.default_route.as_ref()
    }

    /// Whether the backend declares extended reasoning support.
    pub fn supports_extended_reasoning(&self, id: &str) -> bool {
        self.get(id)
            .is_some_and(|b| b.capabilities.extended_reasoning)
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }
}

/// Incremental constructor for [`BackendCatalog`].
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    backends: Vec<BackendEntry>,
    routes: HashMap<TaskCategory, Route>,
    default_route: Option<Route>,
}

impl CatalogBuilder {
    pub fn backend(mut self, entry: BackendEntry) -> Self {
        self.backends.push(entry);
        self
    }

    pub fn route(mut self, category: TaskCategory, route: Route) -> Self {
        self.routes.insert(category, route);
        self
    }

    pub fn default_route(mut self, route: Route) -> Self {
        self.default_route = Some(route);
        self
    }

    /// Reject duplicate ids. Routes naming unknown backends are kept; those
    /// candidates are simply never usable.
    pub fn build(self) -> Result<BackendCatalog> {
        let mut index = HashMap::with_capacity(self.backends.len());
        for (i, entry) in self.backends.iter().enumerate() {
            if index.insert(entry.id.clone(), i).is_some() {
                return Err(RouterError::DuplicateBackend {
                    id: entry.id.clone(),
                });
            }
        }

        let mut unknown = HashSet::new();
        let routed = self
            .routes
            .values()
            .chain(self.default_route.iter())
            .flat_map(Route::candidates);
        for id in routed {
            if !index.contains_key(id) && unknown.insert(id.to_string()) {
                tracing::warn!(backend = %id, "route references unknown backend");
            }
        }

        tracing::debug!(
            backends = self.backends.len(),
            routes = self.routes.len(),
            has_default = self.default_route.is_some(),
            "backend catalog built"
        );

        Ok(BackendCatalog {
            backends: self.backends,
            index,
            routes: self.routes,
            default_route: self.default_route,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
