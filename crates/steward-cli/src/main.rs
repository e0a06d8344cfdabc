//! CLI entry point for Steward.
//!
//! The `steward` binary is an operator tool: it reads the same configuration
//! and database as the agent and answers questions about them. It never
//! talks to an inference backend.

mod cli;
mod helpers;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::json;
use steward_agent::StewardConfig;
use steward_router::{
    BackendCatalog, FuzzyMatcher, KeywordClassifier, ModelRouter, TaskCategory, Usability,
    parse_model_request,
};
use steward_store::{Database, FactCategory, FactStore, Message, SessionStore};
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands};
use crate::helpers::{config_path, format_millis, init_tracing, preview};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A missing .env is normal.
    let dotenv = dotenvy::dotenv();
    init_tracing("info", cli.json);
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded .env");
    }

    let config = load_config(cli.config.as_deref())?;
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Sessions { key, limit, offset } => {
            let store = open_store(&config, cli.db).await?;
            cmd_sessions(&store, key, limit, offset, out).await
        }
        Commands::History {
            session_id,
            all,
            limit,
        } => {
            let store = open_store(&config, cli.db).await?;
            cmd_history(&store, &session_id, all, limit, out).await
        }
        Commands::Reset { session_id } => {
            let store = open_store(&config, cli.db).await?;
            cmd_reset(&store, &session_id, out).await
        }
        Commands::Delete { session_id } => {
            let store = open_store(&config, cli.db).await?;
            cmd_delete(&store, &session_id, out).await
        }
        Commands::Facts {
            search,
            category,
            limit,
        } => {
            let facts = FactStore::new(open_database(&config, cli.db).await?);
            cmd_facts(&facts, search, category, limit, out).await
        }
        Commands::Forget { id } => {
            let facts = FactStore::new(open_database(&config, cli.db).await?);
            cmd_forget(&facts, id, out).await
        }
        Commands::Route { text } => cmd_route(&config, &text, out),
        Commands::Resolve { text } => cmd_resolve(&config, &text, out),
        Commands::Check => cmd_check(&config, cli.db, out).await,
    }
}

#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn emit(self, value: &serde_json::Value) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// An explicit config path must exist; the default one may be absent.
fn load_config(flag: Option<&Path>) -> Result<StewardConfig> {
    let path = config_path(flag);
    if !path.exists() && flag.is_none() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(StewardConfig::default());
    }
    StewardConfig::load(&path).with_context(|| format!("failed to load {}", path.display()))
}

async fn open_store(config: &StewardConfig, db_flag: Option<PathBuf>) -> Result<SessionStore> {
    let db = open_database(config, db_flag).await?;
    Ok(SessionStore::new(db).with_keep_recent(config.store.keep_recent))
}

/// `--db` wins over `[store].path`; missing parent directories are created.
async fn open_database(config: &StewardConfig, db_flag: Option<PathBuf>) -> Result<Database> {
    let path = db_flag.unwrap_or_else(|| config.store.path.clone());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let db = Database::open_and_migrate(path.clone())
        .await
        .with_context(|| format!("failed to open database {}", path.display()))?;
    info!(path = %path.display(), "store opened");
    Ok(db)
}

fn build_router(config: &StewardConfig) -> Result<ModelRouter> {
    let catalog = config.catalog().context("invalid backend configuration")?;
    let classifier = KeywordClassifier::from_config(&config.classifier);
    Ok(ModelRouter::new(catalog, config.cooldown).with_classifier(Arc::new(classifier)))
}

// ---------------------------------------------------------------------------
// Subcommand: sessions
// ---------------------------------------------------------------------------

async fn cmd_sessions(
    store: &SessionStore,
    key: Option<String>,
    limit: u32,
    offset: u32,
    out: Output,
) -> Result<()> {
    let sessions = match key {
        Some(key) => store.list_by_key(&key).await?,
        None => store.list(limit, offset).await?,
    };

    if out.json {
        return out.emit(&serde_json::to_value(&sessions)?);
    }
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for s in &sessions {
        let compacted = if s.summary.is_some() { " (compacted)" } else { "" };
        println!(
            "{}  {:<20} {:<8} {:<16} {:>6} msgs  {}{}",
            s.id,
            s.key,
            s.scope.as_str(),
            s.scope_id,
            s.message_count,
            format_millis(s.updated_at),
            compacted,
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: history
// ---------------------------------------------------------------------------

async fn cmd_history(
    store: &SessionStore,
    session_id: &str,
    all: bool,
    limit: Option<u32>,
    out: Output,
) -> Result<()> {
    let session = store.get(session_id).await?;
    let rows = if all {
        store.get_all_messages(session_id).await?
    } else {
        store.get_messages(session_id, limit).await?
    };

    if out.json {
        return out.emit(&json!({ "session": session, "messages": rows }));
    }

    println!(
        "Session {} ({} / {} / {}), {} messages appended",
        session.id,
        session.key,
        session.scope.as_str(),
        session.scope_id,
        session.message_count
    );
    if let Some(summary) = &session.summary {
        println!("\nSummary:\n{summary}");
    }
    println!();

    for row in &rows {
        let marker = if row.compacted { '~' } else { ' ' };
        let msg = &row.message;
        println!(
            "{marker}{:>5} {:<9} {}",
            row.seq,
            msg.role.as_str(),
            preview(&msg.content, 100)
        );
        for call in &msg.tool_calls {
            println!("        -> {} [{}]", call.name, call.id);
        }
        for result in &msg.tool_results {
            let status = if result.is_error { "error" } else { "ok" };
            println!(
                "        <- [{}] {status}: {}",
                result.tool_call_id,
                preview(&result.content, 80)
            );
        }
        for attachment in &msg.attachments {
            println!("        @ {} {}", attachment.mime_type, attachment.uri);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommands: reset, delete
// ---------------------------------------------------------------------------

async fn cmd_reset(store: &SessionStore, session_id: &str, out: Output) -> Result<()> {
    let flagged = store.reset(session_id).await?;
    if out.json {
        return out.emit(&json!({ "session_id": session_id, "flagged": flagged }));
    }
    println!("Session {session_id} reset; {flagged} messages flagged compacted.");
    Ok(())
}

async fn cmd_delete(store: &SessionStore, session_id: &str, out: Output) -> Result<()> {
    store.delete(session_id).await?;
    if out.json {
        return out.emit(&json!({ "session_id": session_id, "deleted": true }));
    }
    println!("Session {session_id} deleted.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommands: facts, forget
// ---------------------------------------------------------------------------

async fn cmd_facts(
    facts: &FactStore,
    search: Option<String>,
    category: Option<String>,
    limit: u32,
    out: Output,
) -> Result<()> {
    let category = category
        .map(|c| c.parse::<FactCategory>())
        .transpose()
        .context("unknown fact category")?;
    let mut found = match &search {
        Some(needle) => facts.search(needle, limit).await?,
        None => facts.list(category, limit).await?,
    };
    if let (Some(_), Some(category)) = (&search, category) {
        found.retain(|f| f.category == category);
    }

    if out.json {
        return out.emit(&serde_json::to_value(&found)?);
    }
    if found.is_empty() {
        println!("No facts.");
        return Ok(());
    }
    for fact in &found {
        println!(
            "{:>6}  {:<10} {:.2}  {}  {}",
            fact.id,
            fact.category.as_str(),
            fact.importance,
            format_millis(fact.created_at),
            preview(&fact.content, 80)
        );
    }
    Ok(())
}

async fn cmd_forget(facts: &FactStore, id: i64, out: Output) -> Result<()> {
    facts.delete(id).await?;
    if out.json {
        return out.emit(&json!({ "fact_id": id, "deleted": true }));
    }
    println!("Fact {id} deleted.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: route
// ---------------------------------------------------------------------------

fn cmd_route(config: &StewardConfig, text: &str, out: Output) -> Result<()> {
    let router = build_router(config)?;
    let history = [Message::user(text)];
    let category = router.classify(&history);
    let none = HashSet::new();
    let selected = router.select_for(category, &none);

    let catalog = router.catalog();
    let candidates: Vec<(String, Usability)> = route_candidates(&catalog, category)
        .into_iter()
        .map(|id| {
            let usability = router.usability(&id, &none);
            (id, usability)
        })
        .collect();
    let cooldowns = router.cooldowns().active();

    if out.json {
        return out.emit(&json!({
            "category": category,
            "selected": selected,
            "candidates": candidates
                .iter()
                .map(|(id, u)| json!({ "id": id, "usability": u.to_string() }))
                .collect::<Vec<_>>(),
            "cooling_down": cooldowns
                .iter()
                .map(|(id, left)| json!({ "id": id, "remaining_secs": left.as_secs() }))
                .collect::<Vec<_>>(),
        }));
    }

    println!("Category: {category}");
    match &selected {
        Some(id) => println!("Selected: {id}"),
        None => println!("Selected: none (no backend available)"),
    }
    println!("\nCandidates:");
    for (id, usability) in &candidates {
        println!("  {id:<32} {usability}");
    }
    if !cooldowns.is_empty() {
        println!("\nCooling down:");
        for (id, left) in &cooldowns {
            println!("  {id:<32} {}s", left.as_secs());
        }
    }
    Ok(())
}

/// Category route then default route, deduplicated, in the order tried.
fn route_candidates(catalog: &BackendCatalog, category: TaskCategory) -> Vec<String> {
    let mut seen = HashSet::new();
    catalog
        .route_for(category)
        .into_iter()
        .chain(catalog.default_route())
        .flat_map(|route| route.candidates())
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Subcommand: resolve
// ---------------------------------------------------------------------------

fn cmd_resolve(config: &StewardConfig, text: &str, out: Output) -> Result<()> {
    let catalog = config.catalog().context("invalid backend configuration")?;
    let requested = parse_model_request(text);
    let matcher = FuzzyMatcher::from_catalog(&catalog);
    // A detected switch request must name the backend as a whole, as in a run.
    let (target, resolved) = match &requested {
        Some(target) => (target.clone(), matcher.match_whole(target)),
        None => {
            let target = text.trim().to_string();
            let resolved = matcher.match_backend(&target);
            (target, resolved)
        }
    };

    if out.json {
        return out.emit(&json!({
            "input": text,
            "switch_request": requested,
            "target": target,
            "backend": resolved,
        }));
    }

    if requested.is_some() {
        println!("Switch request for: {target}");
    }
    match resolved {
        Some(id) => println!("Resolved: {id}"),
        None => println!("No backend matches {target:?}"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check
// ---------------------------------------------------------------------------

async fn cmd_check(config: &StewardConfig, db_flag: Option<PathBuf>, out: Output) -> Result<()> {
    let router = build_router(config)?;
    let catalog = router.catalog();
    let none = HashSet::new();

    let backends: Vec<(String, Usability)> = catalog
        .backends()
        .iter()
        .map(|b| (b.id.clone(), router.usability(&b.id, &none)))
        .collect();

    let mut problems: Vec<String> = Vec::new();
    if catalog.is_empty() {
        problems.push("no backends configured".into());
    }
    if catalog.default_route().is_none() {
        problems.push("no default route".into());
    }
    for category in TaskCategory::ALL {
        let candidates = route_candidates(&catalog, category);
        if !candidates.is_empty() && router.select_for(category, &none).is_none() {
            problems.push(format!("no usable backend for {category} tasks"));
        }
        for id in candidates {
            if catalog.get(&id).is_none() {
                problems.push(format!("route for {category} names unknown backend {id}"));
            }
        }
    }
    problems.dedup();

    let store = open_store(config, db_flag).await;
    let store_ok = store.is_ok();
    if let Err(e) = &store {
        problems.push(format!("store: {e:#}"));
    }

    if out.json {
        out.emit(&json!({
            "backends": backends
                .iter()
                .map(|(id, u)| json!({
                    "id": id,
                    "usability": u.to_string(),
                    "usable": u.is_usable(),
                    "capabilities": catalog.get(id).map(|b| b.capabilities),
                }))
                .collect::<Vec<_>>(),
            "store_ok": store_ok,
            "problems": problems,
        }))?;
    } else {
        println!("Backends:");
        for (id, usability) in &backends {
            let caps = catalog
                .get(id)
                .map(|b| b.capabilities)
                .unwrap_or_default();
            let mut flags = Vec::new();
            if caps.vision {
                flags.push("vision");
            }
            if caps.audio {
                flags.push("audio");
            }
            if caps.extended_reasoning {
                flags.push("reasoning");
            }
            println!("  {id:<32} {:<24} {}", usability.to_string(), flags.join(","));
        }
        println!("\nRoutes:");
        for category in TaskCategory::ALL {
            match catalog.route_for(category) {
                Some(route) => println!(
                    "  {:<10} {}",
                    category.as_str(),
                    route.candidates().collect::<Vec<_>>().join(" -> ")
                ),
                None => println!("  {:<10} (default)", category.as_str()),
            }
        }
        if let Some(route) = catalog.default_route() {
            println!(
                "  {:<10} {}",
                "default",
                route.candidates().collect::<Vec<_>>().join(" -> ")
            );
        }
        println!();
        if problems.is_empty() {
            println!("Configuration OK.");
        } else {
            for problem in &problems {
                println!("problem: {problem}");
            }
        }
    }

    if !problems.is_empty() {
        bail!("{} configuration problem(s) found", problems.len());
    }
    Ok(())
}
