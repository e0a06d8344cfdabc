//! The iteration loop.
//!
//! One [`Runner::run`] call drives a unit of work to completion:
//!
//! ```text
//!   SelectModel ──► BuildContext ──► Stream ──┬─ tool calls ──► ExecuteTools ──► Persist ──┐
//!        ▲                                    │                                          │
//!        │                                    ├─ no tool calls ──► ExtractMemory ──► Done │
//!        │                                    │                                          │
//!        │                                    └─ error ──► Classify ──► (retry | fail)   │
//!        └───────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Recovery rules:
//!
//! - rate limit / auth: quarantine the backend, exclude it for the rest of
//!   the run, reselect;
//! - context overflow: compact once per turn and retry; a second overflow
//!   in the same turn is fatal;
//! - anything else from the backend is fatal;
//! - tool failures are ordinary results; storage failures are logged and
//!   the affected messages are carried in memory.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::StreamExt;
use steward_router::{FuzzyMatcher, ModelRouter, TaskCategory, parse_model_request};
use steward_store::{Attachment, Message, SessionScope, SessionStore, ToolCall, ToolResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::RunnerConfig;
use crate::context;
use crate::error::{AgentError, Result};
use crate::events::{RunEvent, RunSummary};
use crate::llm::{BackendError, BackendEvent, BackendRegistry, InferenceBackend, StreamRequest};
use crate::memory::{MemoryJob, MemoryQueueHandle};
use crate::tools::ToolExecutor;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One unit of conversational work.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_key: String,
    pub scope: SessionScope,
    pub scope_id: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    /// Backend id or alias to use instead of the router's choice.
    pub model_override: Option<String>,
    /// Replaces the configured system prompt for this run.
    pub system_prompt: Option<String>,
    pub cancel: CancellationToken,
}

impl RunRequest {
    /// A request in the global scope.
    pub fn new(session_key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            scope: SessionScope::Global,
            scope_id: String::new(),
            prompt: prompt.into(),
            attachments: Vec::new(),
            model_override: None,
            system_prompt: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_scope(mut self, scope: SessionScope, scope_id: impl Into<String>) -> Self {
        self.scope = scope;
        self.scope_id = scope_id.into();
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Drives backends and tools for one session at a time per call.
///
/// A `Runner` is shared; concurrent runs must target different sessions for
/// their logs to stay in call order.
pub struct Runner {
    store: SessionStore,
    router: Arc<ModelRouter>,
    backends: BackendRegistry,
    tools: Arc<dyn ToolExecutor>,
    config: RunnerConfig,
    memory: Option<MemoryQueueHandle>,
}

/// Mutable bookkeeping for one run.
#[derive(Default)]
struct RunState {
    session_id: Option<String>,
    summary: Option<String>,
    /// Messages not yet in the store, oldest first.
    unpersisted: VecDeque<Message>,
    excluded: HashSet<String>,
    /// Reset after every completed tool turn.
    compaction_attempted: bool,
    report: RunSummary,
}

/// What one backend stream produced.
#[derive(Default)]
struct TurnOutput {
    text: String,
    calls: Vec<ToolCall>,
}

impl Runner {
    pub fn new(
        store: SessionStore,
        router: Arc<ModelRouter>,
        backends: BackendRegistry,
        tools: Arc<dyn ToolExecutor>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            router,
            backends,
            tools,
            config,
            memory: None,
        }
    }

    /// Submit finished conversations to a memory queue.
    pub fn with_memory_queue(mut self, queue: MemoryQueueHandle) -> Self {
        self.memory = Some(queue);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `request` to completion, streaming progress into `events`.
    ///
    /// Exactly one terminal event is sent before returning. The returned
    /// error mirrors a [`RunEvent::Failed`] or [`RunEvent::Cancelled`].
    #[instrument(skip_all, fields(session_key = %request.session_key, scope = %request.scope))]
    pub async fn run(
        &self,
        request: RunRequest,
        events: mpsc::Sender<RunEvent>,
    ) -> Result<RunSummary> {
        let cancel = request.cancel.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            outcome = self.drive(request, &events) => outcome,
        };

        match outcome {
            Ok((text, summary)) => {
                tracing::info!(
                    session_id = ?summary.session_id,
                    turns = summary.turns,
                    tool_calls = summary.tool_calls,
                    "run completed"
                );
                emit(
                    &events,
                    RunEvent::Done {
                        text,
                        summary: summary.clone(),
                    },
                )
                .await;
                Ok(summary)
            }
            Err(AgentError::Cancelled) => {
                tracing::info!("run cancelled");
                emit(&events, RunEvent::Cancelled).await;
                Err(AgentError::Cancelled)
            }
            Err(e) => {
                tracing::warn!(error = %e, kind = ?e.kind(), "run failed");
                emit(
                    &events,
                    RunEvent::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                )
                .await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        request: RunRequest,
        events: &mpsc::Sender<RunEvent>,
    ) -> Result<(String, RunSummary)> {
        let mut state = RunState::default();

        match self
            .store
            .get_or_create(&request.session_key, request.scope, &request.scope_id)
            .await
        {
            Ok(session) => {
                state.session_id = Some(session.id);
                state.summary = session.summary;
            }
            Err(e) => {
                tracing::warn!(error = %e, "session unavailable, running in memory");
            }
        }
        state.report.session_id = state.session_id.clone();

        let override_id = self.resolve_override(&request);
        let system_prompt = request
            .system_prompt
            .clone()
            .or_else(|| self.config.system_prompt.clone());
        let tool_definitions = self.tools.definitions();

        let mut user = Message::user(request.prompt);
        user.attachments = request.attachments;
        self.persist(&mut state, user).await;

        loop {
            if state.report.turns >= self.config.max_turns {
                return Err(AgentError::MaxTurnsExceeded {
                    max_turns: self.config.max_turns,
                });
            }
            state.report.turns += 1;
            let turn = state.report.turns;

            let messages = self.build_context(&mut state, events).await;
            let category = self.router.classify(&messages);
            let (backend_id, backend) =
                self.select_backend(category, override_id.as_deref(), &mut state.excluded)?;
            if !state.report.backends_tried.contains(&backend_id) {
                state.report.backends_tried.push(backend_id.clone());
            }
            emit(
                events,
                RunEvent::BackendSelected {
                    backend: backend_id.clone(),
                    category,
                    turn,
                },
            )
            .await;

            let catalog = self.router.catalog();
            let extended_reasoning = category == TaskCategory::Reasoning
                && catalog.supports_extended_reasoning(&backend_id);
            let model = catalog
                .get(&backend_id)
                .map(|b| b.model.clone())
                .unwrap_or_default();

            tracing::debug!(
                turn,
                backend = %backend_id,
                category = %category,
                messages = messages.len(),
                extended_reasoning,
                "turn start"
            );

            let stream_request = StreamRequest {
                model,
                messages: messages.clone(),
                tools: tool_definitions.clone(),
                system_prompt: system_prompt.clone(),
                extended_reasoning,
                cancel: request.cancel.clone(),
            };

            let output = match stream_turn(backend.as_ref(), stream_request, events).await {
                Ok(output) => {
                    self.router.mark_succeeded(&backend_id);
                    output
                }
                Err(e) if e.is_context_overflow() => {
                    if state.compaction_attempted {
                        return Err(AgentError::ContextOverflow {
                            backend: backend_id,
                        });
                    }
                    tracing::warn!(backend = %backend_id, error = %e, "context overflow, compacting");
                    self.compact(&mut state, events).await;
                    continue;
                }
                Err(e) if e.is_rate_limit_or_auth() => {
                    let window = self.router.mark_failed(&backend_id);
                    tracing::warn!(
                        backend = %backend_id,
                        error = %e,
                        cooldown_secs = window.as_secs(),
                        "backend quarantined, reselecting"
                    );
                    state.excluded.insert(backend_id);
                    continue;
                }
                Err(e) => {
                    return Err(AgentError::Backend {
                        backend: backend_id,
                        source: e,
                    });
                }
            };

            if output.calls.is_empty() {
                let reply = Message::assistant(output.text.clone());
                self.persist(&mut state, reply.clone()).await;
                self.submit_memory(&state, messages, reply);
                state.report.unpersisted = state.unpersisted.len();
                return Ok((output.text, state.report));
            }

            tracing::info!(
                turn,
                tool_count = output.calls.len(),
                tools = ?output.calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                "backend requested tool calls"
            );
            let results = self.execute_tools(&output.calls, events).await;
            state.report.tool_calls += results.len();

            self.persist(
                &mut state,
                Message::assistant_with_calls(output.text, output.calls),
            )
            .await;
            self.persist(&mut state, Message::tool_results(results)).await;
            state.compaction_attempted = false;
        }
    }

    // -- Model selection -----------------------------------------------------

    /// Backend id named by the request or by a switch request in the prompt.
    ///
    /// A name found in the prompt must match as a whole, so an ordinary
    /// sentence that happens to start with "try" or "use" keeps the route.
    fn resolve_override(&self, request: &RunRequest) -> Option<String> {
        let matcher = FuzzyMatcher::from_catalog(&self.router.catalog());
        let (wanted, resolved) = match &request.model_override {
            Some(wanted) => (wanted.clone(), matcher.match_backend(wanted)),
            None => {
                let wanted = parse_model_request(&request.prompt)?;
                let resolved = matcher.match_whole(&wanted);
                (wanted, resolved)
            }
        };
        match &resolved {
            Some(id) => tracing::info!(requested = %wanted, backend = %id, "model override resolved"),
            None => tracing::debug!(requested = %wanted, "model override matched no backend"),
        }
        resolved
    }

    /// Usable override first, router otherwise. Backends whose provider has
    /// no registered client are excluded and selection repeats.
    fn select_backend(
        &self,
        category: TaskCategory,
        override_id: Option<&str>,
        excluded: &mut HashSet<String>,
    ) -> Result<(String, Arc<dyn InferenceBackend>)> {
        loop {
            let id = override_id
                .filter(|id| self.router.usability(id, &*excluded).is_usable())
                .map(str::to_string)
                .or_else(|| self.router.select_for(category, &*excluded))
                .ok_or(AgentError::NoBackendAvailable { category })?;

            let provider = self.router.catalog().get(&id).map(|b| b.provider.clone());
            match provider.and_then(|p| self.backends.get(&p)) {
                Some(backend) => return Ok((id, backend)),
                None => {
                    tracing::warn!(backend = %id, "no client registered for provider, excluding");
                    excluded.insert(id);
                }
            }
        }
    }

    // -- Context -------------------------------------------------------------

    async fn build_context(
        &self,
        state: &mut RunState,
        events: &mpsc::Sender<RunEvent>,
    ) -> Vec<Message> {
        let mut window = self.load_window(state).await;
        let carried: Vec<Message> = state.unpersisted.iter().cloned().collect();

        let estimate = context::estimate_tokens(&window) + context::estimate_tokens(&carried);
        if estimate > self.config.max_context_tokens && !state.compaction_attempted {
            tracing::info!(
                estimate,
                budget = self.config.max_context_tokens,
                "context over budget, compacting"
            );
            self.compact(state, events).await;
            window = self.load_window(state).await;
        }

        context::assemble(
            state.summary.as_deref(),
            window,
            carried,
            self.config.keep_full_tool_results,
            self.config.tool_result_char_cap,
        )
    }

    async fn load_window(&self, state: &RunState) -> Vec<Message> {
        let Some(session_id) = &state.session_id else {
            return Vec::new();
        };
        match self
            .store
            .get_messages(session_id, Some(self.config.history_limit))
            .await
        {
            Ok(rows) => rows.into_iter().map(Message::from).collect(),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "history unavailable");
                Vec::new()
            }
        }
    }

    /// Fold everything but the store's keep window into the session summary.
    async fn compact(&self, state: &mut RunState, events: &mpsc::Sender<RunEvent>) {
        state.compaction_attempted = true;
        let Some(session_id) = state.session_id.clone() else {
            return;
        };

        // Unsanitized rows, so the count matches what the store flags.
        let live: Vec<_> = match self.store.get_all_messages(&session_id).await {
            Ok(rows) => rows.into_iter().filter(|r| !r.compacted).collect(),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "compaction skipped");
                return;
            }
        };
        let older = live.len().saturating_sub(self.store.keep_recent());
        if older == 0 {
            tracing::debug!(session_id = %session_id, live = live.len(), "nothing to compact");
            return;
        }
        let doomed: Vec<Message> = live.into_iter().take(older).map(Message::from).collect();
        let summary = context::synthesize_summary(state.summary.as_deref(), &doomed);

        match self.store.compact(&session_id, &summary).await {
            Ok(outcome) if !outcome.is_noop() => {
                state.summary = Some(summary);
                state.report.compacted = true;
                emit(
                    events,
                    RunEvent::Compacted {
                        compacted: outcome.compacted,
                    },
                )
                .await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "compaction failed");
            }
        }
    }

    // -- Tools ---------------------------------------------------------------

    /// Run calls one after another in the order the backend sent them.
    async fn execute_tools(
        &self,
        calls: &[ToolCall],
        events: &mpsc::Sender<RunEvent>,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            emit(
                events,
                RunEvent::ToolStarted {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                },
            )
            .await;
            let result = self.tools.execute(call).await;
            emit(
                events,
                RunEvent::ToolFinished {
                    call_id: call.id.clone(),
                    is_error: result.is_error,
                },
            )
            .await;
            results.push(result);
        }
        results
    }

    // -- Persistence ---------------------------------------------------------

    /// Queue `message` and flush the queue in order. A failed append leaves
    /// it and everything after it in memory for the next attempt.
    async fn persist(&self, state: &mut RunState, message: Message) {
        state.unpersisted.push_back(message);
        let Some(session_id) = state.session_id.clone() else {
            return;
        };

        while let Some(next) = state.unpersisted.front() {
            match self.store.append_message(&session_id, next.clone()).await {
                Ok(_) => {
                    state.unpersisted.pop_front();
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        pending = state.unpersisted.len(),
                        "message not persisted, keeping in memory"
                    );
                    break;
                }
            }
        }
    }

    fn submit_memory(&self, state: &RunState, mut messages: Vec<Message>, reply: Message) {
        let Some(queue) = &self.memory else {
            return;
        };
        messages.push(reply);
        queue.submit(MemoryJob {
            session_id: state.session_id.clone(),
            messages,
        });
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Forward one backend stream, collecting text and tool calls.
async fn stream_turn(
    backend: &dyn InferenceBackend,
    request: StreamRequest,
    events: &mpsc::Sender<RunEvent>,
) -> std::result::Result<TurnOutput, BackendError> {
    let mut stream = backend.stream(request).await?;
    let mut output = TurnOutput::default();

    while let Some(event) = stream.next().await {
        match event {
            BackendEvent::TextDelta(text) => {
                output.text.push_str(&text);
                emit(events, RunEvent::TextDelta { text }).await;
            }
            BackendEvent::ThinkingDelta(text) => {
                emit(events, RunEvent::ThinkingDelta { text }).await;
            }
            BackendEvent::ToolCall(call) => {
                emit(events, RunEvent::ToolCallRequested { call: call.clone() }).await;
                output.calls.push(call);
            }
            BackendEvent::ToolResult(result) => {
                emit(events, RunEvent::ToolResultEcho { result }).await;
            }
            BackendEvent::Error(e) => return Err(e),
            BackendEvent::Done => break,
        }
    }
    Ok(output)
}

/// Deliver an event; a caller that stopped listening does not stop the run.
async fn emit(events: &mpsc::Sender<RunEvent>, event: RunEvent) {
    if events.send(event).await.is_err() {
        tracing::trace!("event receiver dropped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
