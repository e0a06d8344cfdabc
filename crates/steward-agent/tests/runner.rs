//! End-to-end tests for the Runner.
//!
//! Backends are scripted: each `stream` call pops the next step and either
//! fails before streaming, streams a fixed list of events, or hangs until
//! cancelled. Sessions live in an in-memory SQLite database so every test
//! can inspect exactly what was persisted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::{Value, json};
use steward_agent::{
    AgentError, BackendError, BackendEvent, BackendRegistry, EventStream, HeuristicExtractor,
    InferenceBackend, MemoryQueue, MemoryQueueConfig, RunErrorKind, RunEvent, RunRequest,
    RunSummary, Runner, RunnerConfig, StreamRequest, ToolAdapter, ToolDefinition, ToolSet,
};
use steward_router::{
    BackendCatalog, BackendEntry, Capabilities, CooldownPolicy, ModelRouter, Route, TaskCategory,
};
use steward_store::{
    Database, FactStore, Message, Role, SessionMessage, SessionScope, SessionStore, ToolCall,
    ToolResult,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── fakes ─────────────────────────────────────────────────────────────────────

enum Step {
    Fail(BackendError),
    Reply(Vec<BackendEvent>),
    Hang,
}

struct Scripted {
    provider: String,
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl Scripted {
    fn new(provider: &str, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            provider: provider.to_string(),
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for Scripted {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn stream(&self, request: StreamRequest) -> Result<EventStream, BackendError> {
        self.requests.lock().unwrap().push(request);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Reply(events)) => Ok(Box::pin(stream::iter(events))),
            Some(Step::Hang) => Ok(Box::pin(stream::pending::<BackendEvent>())),
            None => Err(BackendError::other("script exhausted")),
        }
    }
}

fn text(reply: &str) -> Step {
    Step::Reply(vec![BackendEvent::TextDelta(reply.to_string()), BackendEvent::Done])
}

fn call(id: &str, tool: &str, input: Value) -> Step {
    Step::Reply(vec![
        BackendEvent::ToolCall(ToolCall::new(id, tool, input)),
        BackendEvent::Done,
    ])
}

fn rate_limited() -> BackendError {
    BackendError::from_message("429 Too Many Requests")
}

fn overflow() -> BackendError {
    BackendError::from_message("prompt is too long: 210000 tokens > 200000 maximum")
}

struct Echo;

#[async_trait]
impl ToolAdapter for Echo {
    fn adapter_id(&self) -> &str {
        "echo"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::new(
            "echo",
            "Repeat the given text",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        )]
    }

    async fn execute(&self, _tool_name: &str, input: Value) -> steward_agent::Result<String> {
        Ok(input["text"].as_str().unwrap_or_default().to_string())
    }
}

// ── harness ───────────────────────────────────────────────────────────────────

struct Harness {
    runner: Runner,
    store: SessionStore,
    router: Arc<ModelRouter>,
    db: Database,
}

async fn harness(
    catalog: BackendCatalog,
    backends: &[Arc<Scripted>],
    config: RunnerConfig,
) -> Harness {
    harness_with_policy(catalog, backends, config, CooldownPolicy::default()).await
}

async fn harness_with_policy(
    catalog: BackendCatalog,
    backends: &[Arc<Scripted>],
    config: RunnerConfig,
    policy: CooldownPolicy,
) -> Harness {
    let db = Database::in_memory_migrated().await.unwrap();
    let store = SessionStore::new(db.clone());
    let router = Arc::new(ModelRouter::new(catalog, policy));
    let registry = backends.iter().fold(BackendRegistry::new(), |registry, backend| {
        registry.register(backend.clone())
    });
    let runner = Runner::new(
        store.clone(),
        router.clone(),
        registry,
        Arc::new(ToolSet::new().with_adapter(Arc::new(Echo))),
        config,
    );
    Harness {
        runner,
        store,
        router,
        db,
    }
}

/// `alpha/one` as the only backend, on the default route.
fn single_catalog() -> BackendCatalog {
    BackendCatalog::builder()
        .backend(BackendEntry::new("alpha/one").unwrap())
        .default_route(Route::new("alpha/one"))
        .build()
        .unwrap()
}

/// `alpha/one` primary with `beta/two` (tagged `fast`) as fallback.
fn pair_catalog() -> BackendCatalog {
    BackendCatalog::builder()
        .backend(BackendEntry::new("alpha/one").unwrap())
        .backend(BackendEntry::new("beta/two").unwrap().with_tags(["fast"]))
        .default_route(Route::new("alpha/one").with_fallback("beta/two"))
        .build()
        .unwrap()
}

async fn run(
    runner: &Runner,
    request: RunRequest,
) -> (Result<RunSummary, AgentError>, Vec<RunEvent>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let result = runner.run(request, tx).await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (result, events)
}

async fn persisted(store: &SessionStore, summary: &RunSummary) -> Vec<SessionMessage> {
    let session_id = summary.session_id.as_deref().unwrap();
    store.get_all_messages(session_id).await.unwrap()
}

async fn persisted_for_key(store: &SessionStore, key: &str) -> Vec<SessionMessage> {
    let session = store
        .find(key, SessionScope::Global, "")
        .await
        .unwrap()
        .unwrap();
    store.get_all_messages(&session.id).await.unwrap()
}

fn assert_single_terminal(events: &[RunEvent]) {
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "expected exactly one terminal event: {events:?}");
    assert!(events.last().unwrap().is_terminal(), "terminal event must be last");
}

// ── completion ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn text_only_turn_persists_one_assistant_message() {
    let alpha = Scripted::new(
        "alpha",
        vec![Step::Reply(vec![
            BackendEvent::TextDelta("Hel".into()),
            BackendEvent::TextDelta("lo".into()),
            BackendEvent::Done,
        ])],
    );
    let h = harness(single_catalog(), &[alpha.clone()], RunnerConfig::default()).await;

    let (result, events) = run(&h.runner, RunRequest::new("chat", "hi")).await;
    let summary = result.unwrap();
    assert_eq!(summary.turns, 1);
    assert_eq!(summary.backends_tried, vec!["alpha/one".to_string()]);
    assert!(!summary.compacted);

    assert_single_terminal(&events);
    assert!(matches!(
        &events[0],
        RunEvent::BackendSelected { backend, category: TaskCategory::General, turn: 1 }
            if backend == "alpha/one"
    ));
    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Hel", "lo"]);
    assert!(matches!(events.last(), Some(RunEvent::Done { text, .. }) if text == "Hello"));

    let rows = persisted(&h.store, &summary).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].message.role, Role::User);
    assert_eq!(rows[1].message.role, Role::Assistant);
    assert_eq!(rows[1].message.content, "Hello");
    assert!(rows[1].message.tool_calls.is_empty());

    let request = &alpha.requests()[0];
    assert_eq!(request.model, "one");
    assert_eq!(request.tools.len(), 1);
    assert!(!request.extended_reasoning);
}

#[tokio::test]
async fn tool_calls_loop_until_the_backend_answers() {
    let alpha = Scripted::new(
        "alpha",
        vec![call("c1", "echo", json!({"text": "pong"})), text("got pong")],
    );
    let h = harness(single_catalog(), &[alpha.clone()], RunnerConfig::default()).await;

    let (result, events) = run(&h.runner, RunRequest::new("chat", "ping the echo tool")).await;
    let summary = result.unwrap();
    assert_eq!(summary.turns, 2);
    assert_eq!(summary.tool_calls, 1);
    assert_single_terminal(&events);

    let started = events.iter().position(|e| {
        matches!(e, RunEvent::ToolStarted { call_id, name } if call_id == "c1" && name == "echo")
    });
    let finished = events.iter().position(|e| {
        matches!(e, RunEvent::ToolFinished { call_id, is_error: false } if call_id == "c1")
    });
    assert!(started.unwrap() < finished.unwrap());

    let rows = persisted(&h.store, &summary).await;
    let roles: Vec<Role> = rows.iter().map(|r| r.message.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(rows[1].message.tool_calls[0].id, "c1");
    assert_eq!(rows[2].message.tool_results[0].tool_call_id, "c1");
    assert_eq!(rows[2].message.tool_results[0].content, "pong");
    assert_eq!(rows[3].message.content, "got pong");
    let seqs: Vec<i64> = rows.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    // The second turn sees the tool result.
    let second = &alpha.requests()[1];
    let last = second.messages.last().unwrap();
    assert_eq!(last.tool_results[0].content, "pong");
}

#[tokio::test]
async fn unknown_tool_is_reported_to_the_backend_not_fatal() {
    let alpha = Scripted::new(
        "alpha",
        vec![call("c1", "rm", json!({"path": "/"})), text("could not delete")],
    );
    let h = harness(single_catalog(), &[alpha], RunnerConfig::default()).await;

    let (result, events) = run(&h.runner, RunRequest::new("chat", "clean up")).await;
    let summary = result.unwrap();
    assert!(events.iter().any(|e| matches!(e, RunEvent::ToolFinished { is_error: true, .. })));

    let rows = persisted(&h.store, &summary).await;
    assert!(rows[2].message.tool_results[0].is_error);
    assert!(rows[2].message.tool_results[0].content.starts_with("Error:"));
}

// ── failover ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rate_limited_backend_is_quarantined_and_replaced() {
    let alpha = Scripted::new("alpha", vec![Step::Fail(rate_limited())]);
    let beta = Scripted::new("beta", vec![text("from beta")]);
    let h = harness(pair_catalog(), &[alpha.clone(), beta.clone()], RunnerConfig::default()).await;

    let (result, events) = run(&h.runner, RunRequest::new("chat", "hi")).await;
    let summary = result.unwrap();
    assert_eq!(
        summary.backends_tried,
        vec!["alpha/one".to_string(), "beta/two".to_string()]
    );
    assert_eq!(summary.turns, 2);
    assert!(!h.router.cooldown_remaining("alpha/one").is_zero());
    assert!(h.router.cooldown_remaining("beta/two").is_zero());
    assert!(matches!(events.last(), Some(RunEvent::Done { text, .. }) if text == "from beta"));
    assert_eq!(alpha.requests().len(), 1);
    assert_eq!(beta.requests().len(), 1);
}

#[tokio::test]
async fn success_resets_the_failure_streak() {
    let alpha = Scripted::new(
        "alpha",
        vec![Step::Fail(rate_limited()), text("alpha is back"), Step::Fail(rate_limited())],
    );
    let beta = Scripted::new("beta", vec![text("beta one"), text("beta two")]);
    let policy = CooldownPolicy {
        base_secs: 1,
        ceiling_secs: 60,
    };
    let h = harness_with_policy(
        pair_catalog(),
        &[alpha.clone(), beta],
        RunnerConfig::default(),
        policy,
    )
    .await;

    run(&h.runner, RunRequest::new("chat", "hi")).await.0.unwrap();
    assert_eq!(h.router.cooldowns().state("alpha/one").unwrap().consecutive_failures, 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = run(&h.runner, RunRequest::new("chat", "hi again")).await.0.unwrap();
    assert_eq!(second.backends_tried, vec!["alpha/one".to_string()]);
    assert!(h.router.cooldowns().state("alpha/one").is_none());

    run(&h.runner, RunRequest::new("chat", "and again")).await.0.unwrap();
    let state = h.router.cooldowns().state("alpha/one").unwrap();
    assert_eq!(state.consecutive_failures, 1);
    assert!(h.router.cooldown_remaining("alpha/one") <= policy.window(1));
    assert_eq!(alpha.requests().len(), 3);
}

#[tokio::test]
async fn auth_error_mid_stream_also_fails_over() {
    let alpha = Scripted::new(
        "alpha",
        vec![Step::Reply(vec![
            BackendEvent::TextDelta("partial ".into()),
            BackendEvent::Error(BackendError::from_message("401 Unauthorized")),
        ])],
    );
    let beta = Scripted::new("beta", vec![text("fine")]);
    let h = harness(pair_catalog(), &[alpha, beta], RunnerConfig::default()).await;

    let (result, events) = run(&h.runner, RunRequest::new("chat", "hi")).await;
    result.unwrap();
    // Text already streamed stays streamed.
    assert!(matches!(&events[1], RunEvent::TextDelta { text } if text == "partial "));
    assert!(matches!(events.last(), Some(RunEvent::Done { text, .. }) if text == "fine"));
}

#[tokio::test]
async fn unclassified_backend_error_is_fatal() {
    let alpha = Scripted::new(
        "alpha",
        vec![Step::Fail(BackendError::from_message("500 Internal Server Error"))],
    );
    let beta = Scripted::new("beta", vec![text("never")]);
    let h = harness(pair_catalog(), &[alpha, beta.clone()], RunnerConfig::default()).await;

    let (result, events) = run(&h.runner, RunRequest::new("chat", "hi")).await;
    assert!(matches!(result, Err(AgentError::Backend { ref backend, .. }) if backend == "alpha/one"));
    assert_single_terminal(&events);
    assert!(matches!(events.last(), Some(RunEvent::Failed { kind: RunErrorKind::Backend, .. })));
    assert!(beta.requests().is_empty());
    assert!(h.router.cooldown_remaining("alpha/one").is_zero());
}

#[tokio::test]
async fn no_usable_backend_is_a_configuration_failure() {
    let catalog = BackendCatalog::builder()
        .backend(BackendEntry::new("alpha/one").unwrap().without_credentials())
        .default_route(Route::new("alpha/one"))
        .build()
        .unwrap();
    let alpha = Scripted::new("alpha", vec![text("unreachable")]);
    let h = harness(catalog, &[alpha.clone()], RunnerConfig::default()).await;

    let (result, events) = run(&h.runner, RunRequest::new("chat", "hi")).await;
    assert!(matches!(result, Err(AgentError::NoBackendAvailable { .. })));
    assert_single_terminal(&events);
    assert!(matches!(
        events.last(),
        Some(RunEvent::Failed { kind: RunErrorKind::Configuration, .. })
    ));
    assert!(alpha.requests().is_empty());

    // The user message was still recorded.
    let rows = persisted_for_key(&h.store, "chat").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].message.role, Role::User);
}

#[tokio::test]
async fn provider_without_client_is_skipped() {
    // `ghost/x` is routable but no client serves the `ghost` provider.
    let catalog = BackendCatalog::builder()
        .backend(BackendEntry::new("ghost/x").unwrap())
        .backend(BackendEntry::new("alpha/one").unwrap())
        .default_route(Route::new("ghost/x").with_fallback("alpha/one"))
        .build()
        .unwrap();
    let alpha = Scripted::new("alpha", vec![text("here")]);
    let h = harness(catalog, &[alpha], RunnerConfig::default()).await;

    let (result, _) = run(&h.runner, RunRequest::new("chat", "hi")).await;
    let summary = result.unwrap();
    assert_eq!(summary.backends_tried, vec!["alpha/one".to_string()]);
    assert_eq!(summary.turns, 1);
}

// ── model overrides ───────────────────────────────────────────────────────────

#[tokio::test]
async fn switch_request_in_prompt_overrides_the_route() {
    let alpha = Scripted::new("alpha", vec![text("alpha")]);
    let beta = Scripted::new("beta", vec![text("beta")]);
    let h = harness(pair_catalog(), &[alpha.clone(), beta], RunnerConfig::default()).await;

    let (result, events) = run(&h.runner, RunRequest::new("chat", "switch to the fast model")).await;
    assert_eq!(result.unwrap().backends_tried, vec!["beta/two".to_string()]);
    assert!(matches!(events.last(), Some(RunEvent::Done { text, .. }) if text == "beta"));
    assert!(alpha.requests().is_empty());
}

#[tokio::test]
async fn sentence_mentioning_a_tag_keeps_the_route() {
    let alpha = Scripted::new("alpha", vec![text("sorted")]);
    let beta = Scripted::new("beta", vec![text("beta")]);
    let h = harness(pair_catalog(), &[alpha, beta.clone()], RunnerConfig::default()).await;

    let (result, _) = run(&h.runner, RunRequest::new("chat", "try a fast way to sort this")).await;
    assert_eq!(result.unwrap().backends_tried, vec!["alpha/one".to_string()]);
    assert!(beta.requests().is_empty());
}

#[tokio::test]
async fn cooling_override_falls_back_to_the_router() {
    let alpha = Scripted::new("alpha", vec![text("alpha")]);
    let beta = Scripted::new("beta", vec![text("beta")]);
    let h = harness(pair_catalog(), &[alpha, beta.clone()], RunnerConfig::default()).await;
    h.router.mark_failed("beta/two");

    let request = RunRequest::new("chat", "hi").with_model("beta/two");
    let (result, _) = run(&h.runner, request).await;
    assert_eq!(result.unwrap().backends_tried, vec!["alpha/one".to_string()]);
    assert!(beta.requests().is_empty());
}

#[tokio::test]
async fn extended_reasoning_only_for_capable_backends_on_reasoning_tasks() {
    let catalog = BackendCatalog::builder()
        .backend(BackendEntry::new("alpha/one").unwrap().with_capabilities(Capabilities {
            extended_reasoning: true,
            ..Capabilities::default()
        }))
        .default_route(Route::new("alpha/one"))
        .build()
        .unwrap();
    let alpha = Scripted::new("alpha", vec![text("QED"), text("hello")]);
    let h = harness(catalog, &[alpha.clone()], RunnerConfig::default()).await;

    run(&h.runner, RunRequest::new("math", "prove it step by step")).await.0.unwrap();
    run(&h.runner, RunRequest::new("small-talk", "hello there")).await.0.unwrap();

    let requests = alpha.requests();
    assert!(requests[0].extended_reasoning);
    assert!(!requests[1].extended_reasoning);
}

#[tokio::test]
async fn request_system_prompt_replaces_configured_one() {
    let alpha = Scripted::new("alpha", vec![text("a"), text("b")]);
    let config = RunnerConfig {
        system_prompt: Some("configured".into()),
        ..RunnerConfig::default()
    };
    let h = harness(single_catalog(), &[alpha.clone()], config).await;

    run(&h.runner, RunRequest::new("one", "hi")).await.0.unwrap();
    run(&h.runner, RunRequest::new("two", "hi").with_system_prompt("per request"))
        .await
        .0
        .unwrap();

    let requests = alpha.requests();
    assert_eq!(requests[0].system_prompt.as_deref(), Some("configured"));
    assert_eq!(requests[1].system_prompt.as_deref(), Some("per request"));
}

// ── context overflow ──────────────────────────────────────────────────────────

async fn seed(store: &SessionStore, key: &str, pairs: usize) {
    let session = store.get_or_create(key, SessionScope::Global, "").await.unwrap();
    for i in 0..pairs {
        store
            .append_message(&session.id, Message::user(format!("question {i}")))
            .await
            .unwrap();
        store
            .append_message(&session.id, Message::assistant(format!("answer {i}")))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn overflow_compacts_once_and_retries() {
    let alpha = Scripted::new("alpha", vec![Step::Fail(overflow()), text("fits now")]);
    let h = harness(single_catalog(), &[alpha.clone()], RunnerConfig::default()).await;
    seed(&h.store, "long", 6).await;

    let (result, events) = run(&h.runner, RunRequest::new("long", "and one more")).await;
    let summary = result.unwrap();
    assert!(summary.compacted);
    assert_eq!(summary.turns, 2);
    // 13 live messages, 10 kept.
    assert!(events.iter().any(|e| matches!(e, RunEvent::Compacted { compacted: 3 })));

    let session = h
        .store
        .find("long", SessionScope::Global, "")
        .await
        .unwrap()
        .unwrap();
    let stored_summary = session.summary.unwrap();
    assert!(stored_summary.starts_with("[Conversation summary of 3 earlier messages]"));
    assert!(stored_summary.contains("- question 0"));

    let retry = &alpha.requests()[1];
    assert_eq!(retry.messages[0].role, Role::System);
    assert!(retry.messages[0].content.contains("question 0"));
    assert_eq!(retry.messages.len(), 11);
    assert_eq!(retry.messages.last().unwrap().content, "and one more");
}

#[tokio::test]
async fn summary_counts_every_compacted_row() {
    let alpha = Scripted::new("alpha", vec![Step::Fail(overflow()), text("fits now")]);
    let h = harness(single_catalog(), &[alpha], RunnerConfig::default()).await;

    // A stale tool result whose call is gone, ahead of the regular history.
    let session = h.store.get_or_create("stale", SessionScope::Global, "").await.unwrap();
    h.store
        .append_message(
            &session.id,
            Message::tool_results(vec![ToolResult::success("gone", "stale output")]),
        )
        .await
        .unwrap();
    seed(&h.store, "stale", 6).await;

    let (result, events) = run(&h.runner, RunRequest::new("stale", "one more")).await;
    assert!(result.unwrap().compacted);
    // 14 live rows, 10 kept.
    assert!(events.iter().any(|e| matches!(e, RunEvent::Compacted { compacted: 4 })));

    let stored = h.store.get(&session.id).await.unwrap().summary.unwrap();
    assert!(stored.starts_with("[Conversation summary of 4 earlier messages]"));
}

#[tokio::test]
async fn second_overflow_in_the_same_turn_is_fatal() {
    let alpha = Scripted::new("alpha", vec![Step::Fail(overflow()), Step::Fail(overflow())]);
    let h = harness(single_catalog(), &[alpha.clone()], RunnerConfig::default()).await;

    let (result, events) = run(&h.runner, RunRequest::new("chat", "hi")).await;
    assert!(matches!(result, Err(AgentError::ContextOverflow { .. })));
    assert_single_terminal(&events);
    assert!(matches!(
        events.last(),
        Some(RunEvent::Failed { kind: RunErrorKind::ContextOverflow, .. })
    ));
    assert_eq!(alpha.requests().len(), 2);

    let rows = persisted_for_key(&h.store, "chat").await;
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn oversized_history_is_compacted_before_streaming() {
    let alpha = Scripted::new("alpha", vec![text("ok")]);
    let config = RunnerConfig {
        max_context_tokens: 10,
        ..RunnerConfig::default()
    };
    let h = harness(single_catalog(), &[alpha.clone()], config).await;
    seed(&h.store, "big", 8).await;

    let (result, _) = run(&h.runner, RunRequest::new("big", "summarize please")).await;
    assert!(result.unwrap().compacted);
    assert_eq!(alpha.requests().len(), 1);
    // Summary plus the ten kept messages.
    assert_eq!(alpha.requests()[0].messages.len(), 11);
}

// ── limits and cancellation ───────────────────────────────────────────────────

#[tokio::test]
async fn turn_cap_ends_with_task_too_long() {
    let steps = (0..5)
        .map(|i| call(&format!("c{i}"), "echo", json!({"text": "again"})))
        .collect();
    let alpha = Scripted::new("alpha", steps);
    let config = RunnerConfig {
        max_turns: 3,
        ..RunnerConfig::default()
    };
    let h = harness(single_catalog(), &[alpha.clone()], config).await;

    let (result, events) = run(&h.runner, RunRequest::new("chat", "loop forever")).await;
    assert!(matches!(result, Err(AgentError::MaxTurnsExceeded { max_turns: 3 })));
    assert_single_terminal(&events);
    match events.last() {
        Some(RunEvent::Failed { kind, message }) => {
            assert_eq!(*kind, RunErrorKind::MaxTurnsExceeded);
            assert!(message.starts_with("task too long"));
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
    assert_eq!(alpha.requests().len(), 3);

    // user + 3 × (assistant with call, tool results)
    assert_eq!(persisted_for_key(&h.store, "chat").await.len(), 7);
}

#[tokio::test]
async fn cancellation_stops_the_run_with_a_single_event() {
    let alpha = Scripted::new("alpha", vec![Step::Hang]);
    let h = harness(single_catalog(), &[alpha], RunnerConfig::default()).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let request = RunRequest::new("chat", "hi").with_cancel(cancel);
    let (result, events) = run(&h.runner, request).await;
    assert!(matches!(result, Err(AgentError::Cancelled)));
    assert_single_terminal(&events);
    assert!(matches!(events.last(), Some(RunEvent::Cancelled)));

    let rows = persisted_for_key(&h.store, "chat").await;
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn already_cancelled_request_does_nothing() {
    let alpha = Scripted::new("alpha", vec![text("unreachable")]);
    let h = harness(single_catalog(), &[alpha.clone()], RunnerConfig::default()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let (result, events) = run(&h.runner, RunRequest::new("chat", "hi").with_cancel(cancel)).await;
    assert!(matches!(result, Err(AgentError::Cancelled)));
    assert_eq!(events.len(), 1);
    assert!(alpha.requests().is_empty());
    assert!(
        h.store
            .find("chat", SessionScope::Global, "")
            .await
            .unwrap()
            .is_none()
    );
}

// ── storage failures ──────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_appends_are_carried_into_the_next_turn() {
    let alpha = Scripted::new(
        "alpha",
        vec![
            text("first"),
            call("c1", "echo", json!({"text": "x"})),
            text("done anyway"),
        ],
    );
    let h = harness(single_catalog(), &[alpha.clone()], RunnerConfig::default()).await;
    run(&h.runner, RunRequest::new("chat", "hi")).await.0.unwrap();

    h.db.execute(|conn| {
        conn.execute_batch("DROP TABLE session_messages")?;
        Ok(())
    })
    .await
    .unwrap();

    let (result, events) = run(&h.runner, RunRequest::new("chat", "echo x")).await;
    let summary = result.unwrap();
    assert!(summary.session_id.is_some());
    // user, assistant with call, tool results, final reply
    assert_eq!(summary.unpersisted, 4);
    assert_single_terminal(&events);
    assert!(matches!(events.last(), Some(RunEvent::Done { text, .. }) if text == "done anyway"));

    let follow_up = &alpha.requests()[2];
    let roles: Vec<Role> = follow_up.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
    assert_eq!(follow_up.messages[0].content, "echo x");
    assert_eq!(follow_up.messages[2].tool_results[0].content, "x");
}

#[tokio::test]
async fn unavailable_session_store_runs_in_memory() {
    let alpha = Scripted::new("alpha", vec![text("still here")]);
    let h = harness(single_catalog(), &[alpha.clone()], RunnerConfig::default()).await;
    h.db.execute(|conn| {
        conn.execute_batch("DROP TABLE session_messages; DROP TABLE sessions;")?;
        Ok(())
    })
    .await
    .unwrap();

    let (result, events) = run(&h.runner, RunRequest::new("chat", "hi")).await;
    let summary = result.unwrap();
    assert_eq!(summary.session_id, None);
    assert_eq!(summary.unpersisted, 2);
    assert!(matches!(events.last(), Some(RunEvent::Done { text, .. }) if text == "still here"));
    assert_eq!(alpha.requests()[0].messages.len(), 1);
}

// ── memory ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn finished_runs_feed_the_memory_queue() {
    let alpha = Scripted::new("alpha", vec![text("noted")]);
    let h = harness(single_catalog(), &[alpha], RunnerConfig::default()).await;
    let facts = FactStore::new(h.db.clone());
    let queue = MemoryQueue::start(
        Arc::new(HeuristicExtractor),
        Arc::new(facts.clone()),
        MemoryQueueConfig::default(),
    );
    let runner = h.runner.with_memory_queue(queue.handle());

    let (result, _) = run(&runner, RunRequest::new("chat", "I prefer short answers")).await;
    let summary = result.unwrap();

    let stats = queue.shutdown().await;
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.saved, 1);
    let saved = facts.list(None, 10).await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].session_id, summary.session_id);
}

// ── sessions ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn runs_continue_the_same_session() {
    let alpha = Scripted::new("alpha", vec![text("first"), text("second")]);
    let h = harness(single_catalog(), &[alpha.clone()], RunnerConfig::default()).await;

    let request = || RunRequest::new("chat", "hi").with_scope(SessionScope::User, "u1");
    let first = run(&h.runner, request()).await.0.unwrap();
    let second = run(&h.runner, request()).await.0.unwrap();
    assert_eq!(first.session_id, second.session_id);

    // The second run saw the first exchange.
    assert_eq!(alpha.requests()[1].messages.len(), 3);
    assert_eq!(persisted(&h.store, &second).await.len(), 4);
}
