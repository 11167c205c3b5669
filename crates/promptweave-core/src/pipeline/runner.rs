//! Pipeline runner: drives one pipeline execution to a single terminal
//! result while allowing concurrent branches.
//!
//! The runner asks the scheduler for starting steps, enqueues each onto the
//! bounded task queue, and reacts to completions: rendering prompts,
//! invoking providers (behind the optional cache and per-provider
//! semaphores), relaying streamed deltas, and interpreting tool-call output
//! by registering virtual steps. The run ends when the queue drains and
//! exactly one leaf has recorded the result.
//!
//! # Execution flow
//!
//! 1. `starting_steps` seeds the queue (declaration order preserved).
//! 2. Each task executes one step and feeds its completion back through
//!    `mark_complete`; returned ready steps are enqueued.
//! 3. A model turn containing function calls becomes a virtual resume step
//!    plus one sub-branch per call; the branches publish their results under
//!    synthetic per-call tokens and the conversation resumes once all of
//!    them (and the original step's completion token) have arrived.
//! 4. A leaf with no pending reply obligation records the terminal result;
//!    a second leaf, or a leaf while other tasks are in flight, is fatal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use promptweave_types::content::{ContentPart, ConversationPrompt, Message, OutputValue};
use promptweave_types::error::{FormatError, ProviderError};
use promptweave_types::model::{
    ModelResponse, PreparedRequest, ProviderEvent, SessionHandle, TokenUsage,
};
use promptweave_types::result::{HistoryEntry, PipelineResult, RunUpdate};

use crate::cache::{cache_key, BoxModelCache};
use crate::format::PromptFormatter;
use crate::provider::{BoxModelProvider, InvocationContext, ProviderRegistry};

use super::context::{overlay_variables, ExecutionContext, PipelineContext};
use super::merge::ordered_merge;
use super::queue::TaskQueue;
use super::state::{PipelineState, ReadyStep, SchedulerError, Transition};
use super::step::Step;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default width of the task queue.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Capacity of the streamed-update channel created by [`PipelineRunner::spawn`].
pub const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Prefix of the synthetic variables that carry function-call round-trip
/// state through branch contexts.
const CALL_VAR_PREFIX: &str = "$call:";

// ---------------------------------------------------------------------------
// RunContext / RunError
// ---------------------------------------------------------------------------

/// Caller-supplied state for one run: the abort signal and optional extras
/// mixed into every cache key.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub abort: CancellationToken,
    pub cache_extras: Option<Value>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_extras(mut self, extras: Value) -> Self {
        self.cache_extras = Some(extras);
        self
    }
}

/// Errors that can occur while a run is in flight. All of them surface to
/// the caller as the run's terminal error string.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("no provider registered for step '{step}'")]
    MissingProvider { step: String },

    #[error("step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: ProviderError,
    },

    #[error("prompt for step '{step}' could not be rendered: {source}")]
    Format {
        step: String,
        #[source]
        source: FormatError,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("function call '{name}' from step '{step}' has no subscriber")]
    UnansweredCall { step: String, name: String },

    #[error("pipeline produced more than one result")]
    MultipleLeaves,

    #[error("pipeline produced a result while {remaining} tasks were still in flight")]
    LeafWhileRunning { remaining: usize },

    #[error("pipeline ended without returning a result")]
    NoResult,

    #[error("run aborted")]
    Aborted,
}

// ---------------------------------------------------------------------------
// Internal run state
// ---------------------------------------------------------------------------

/// One enqueued step execution. `reply_to`, when set, obliges the branch to
/// publish its final context under the given per-call token instead of
/// terminating the run.
struct StepTask {
    step: Arc<Step>,
    context: ExecutionContext,
    reply_to: Option<String>,
}

/// Queue, update channel, and run-scoped inputs shared by all tasks.
struct RunShared {
    queue: TaskQueue,
    updates: mpsc::Sender<RunUpdate>,
    vars: Map<String, Value>,
    cache_extras: Option<Value>,
    cancel: CancellationToken,
}

/// A persisted provider session, keyed by session name.
struct SessionRecord {
    provider: String,
    handle: SessionHandle,
}

/// A function call extracted from model output.
struct FunctionCall {
    id: String,
    name: String,
    arguments: Value,
}

// ---------------------------------------------------------------------------
// PipelineHandle
// ---------------------------------------------------------------------------

/// Streamed updates plus the future carrying the terminal result; the two
/// contracts of a run, kept separate.
pub struct PipelineHandle {
    pub updates: mpsc::Receiver<RunUpdate>,
    pub result: tokio::task::JoinHandle<Result<PipelineResult, SchedulerError>>,
}

// ---------------------------------------------------------------------------
// PipelineRunner
// ---------------------------------------------------------------------------

/// Drives one pipeline execution to a single terminal result.
///
/// A runner instance is scoped to one run: its scheduler state, session map,
/// run counters, and accumulated history all belong to that run. Per-provider
/// request semaphores are owned here, never process-global.
pub struct PipelineRunner {
    state: Mutex<PipelineState<ExecutionContext>>,
    providers: ProviderRegistry,
    default_provider: Option<String>,
    formatter: Arc<dyn PromptFormatter>,
    cache: Option<BoxModelCache>,
    max_parallel: usize,
    sessions: DashMap<String, SessionRecord>,
    run_counts: DashMap<String, u32>,
    history: Mutex<Vec<HistoryEntry>>,
    usage: Mutex<TokenUsage>,
    outcome: Mutex<Option<Result<Vec<ContentPart>, String>>>,
    /// Reply obligations inherited by virtual resume steps, keyed by the
    /// resume step id.
    reply_overrides: Mutex<HashMap<String, Option<String>>>,
    semaphores: DashMap<String, Arc<Semaphore>>,
    suffix: AtomicU64,
}

impl PipelineRunner {
    /// Build a runner for the declared steps. Fails fast on duplicate step
    /// ids.
    pub fn new(
        steps: Vec<Step>,
        providers: ProviderRegistry,
        formatter: Arc<dyn PromptFormatter>,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            state: Mutex::new(PipelineState::new(steps)?),
            providers,
            default_provider: None,
            formatter,
            cache: None,
            max_parallel: DEFAULT_MAX_PARALLEL,
            sessions: DashMap::new(),
            run_counts: DashMap::new(),
            history: Mutex::new(Vec::new()),
            usage: Mutex::new(TokenUsage::default()),
            outcome: Mutex::new(None),
            reply_overrides: Mutex::new(HashMap::new()),
            semaphores: DashMap::new(),
            suffix: AtomicU64::new(0),
        })
    }

    pub fn with_default_provider(mut self, label: impl Into<String>) -> Self {
        self.default_provider = Some(label.into());
        self
    }

    pub fn with_cache(mut self, cache: BoxModelCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Run the pipeline, sending incremental updates to `updates` and
    /// returning the terminal result.
    ///
    /// `Err` is returned only for configuration failures detected before
    /// any step runs; once started, every failure surfaces inside the
    /// returned [`PipelineResult`].
    pub async fn run(
        self: &Arc<Self>,
        vars: Map<String, Value>,
        run_ctx: RunContext,
        updates: mpsc::Sender<RunUpdate>,
    ) -> Result<PipelineResult, SchedulerError> {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let start = Instant::now();
        tracing::info!(run_id = %run_id, "starting pipeline run");

        let starting = self.state.lock().await.starting_steps(&vars)?;
        if starting.is_empty() {
            return Err(SchedulerError::NoStartingSteps);
        }

        let cancel = run_ctx.abort.child_token();
        let shared = Arc::new(RunShared {
            queue: TaskQueue::new(self.max_parallel, cancel.clone()),
            updates,
            vars,
            cache_extras: run_ctx.cache_extras,
            cancel,
        });

        let initial = ExecutionContext::from_variables(shared.vars.clone());
        for step in starting {
            self.enqueue_task(
                &shared,
                StepTask {
                    step,
                    context: initial.clone(),
                    reply_to: None,
                },
            );
        }

        let drained = shared.queue.completed().await;
        let outcome = self.outcome.lock().await.take();
        let (output, error) = match (drained, outcome) {
            (_, Some(Ok(parts))) => (Some(OutputValue::from_parts(parts)), None),
            (_, Some(Err(message))) => (None, Some(message)),
            (Ok(()), None) if shared.cancel.is_cancelled() => {
                (None, Some(RunError::Aborted.to_string()))
            }
            (Ok(()), None) => (None, Some(RunError::NoResult.to_string())),
            (Err(_), None) => (None, Some(RunError::Aborted.to_string())),
        };

        let history = self.history.lock().await.clone();
        let token_usage = *self.usage.lock().await;
        let latency_millis = start.elapsed().as_millis() as u64;
        match &error {
            Some(message) => {
                tracing::warn!(run_id = %run_id, error = message.as_str(), "pipeline run failed")
            }
            None => tracing::info!(run_id = %run_id, latency_millis, "pipeline run complete"),
        }

        Ok(PipelineResult {
            output,
            error,
            history,
            started_at,
            latency_millis,
            token_usage,
        })
    }

    /// Spawn the run onto the runtime, returning the update receiver and
    /// the result future.
    pub fn spawn(self: Arc<Self>, vars: Map<String, Value>, run_ctx: RunContext) -> PipelineHandle {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let result = tokio::spawn(async move { self.run(vars, run_ctx, tx).await });
        PipelineHandle {
            updates: rx,
            result,
        }
    }

    // -----------------------------------------------------------------------
    // Task plumbing
    // -----------------------------------------------------------------------

    fn enqueue_task(self: &Arc<Self>, shared: &Arc<RunShared>, task: StepTask) {
        let runner = Arc::clone(self);
        let task_shared = Arc::clone(shared);
        let step_id = task.step.id.clone();
        shared.queue.enqueue(async move {
            if task_shared.cancel.is_cancelled() {
                return;
            }
            match runner.execute_step(&task_shared, task).await {
                Ok(()) | Err(RunError::Aborted) => {}
                Err(err) => {
                    tracing::warn!(step = step_id.as_str(), error = %err, "step failed, aborting run");
                    runner.record_failure(&task_shared, err).await;
                }
            }
        });
    }

    /// Record the terminal error (first one wins over later step errors,
    /// but consistency violations replace a previously recorded success)
    /// and abort the queue.
    async fn record_failure(&self, shared: &RunShared, err: RunError) {
        {
            let mut outcome = self.outcome.lock().await;
            match outcome.as_ref() {
                Some(Err(_)) => {}
                _ => *outcome = Some(Err(err.to_string())),
            }
        }
        shared.queue.abort();
    }

    // -----------------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------------

    async fn execute_step(
        self: &Arc<Self>,
        shared: &Arc<RunShared>,
        task: StepTask,
    ) -> Result<(), RunError> {
        let step = Arc::clone(&task.step);

        let run_count = {
            let mut counter = self.run_counts.entry(step.id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let instance = if run_count > 1 {
            format!("{}#{}", step.id, run_count)
        } else {
            step.id.clone()
        };
        tracing::debug!(step = instance.as_str(), "executing step");

        let label = step
            .provider_label
            .as_deref()
            .or(self.default_provider.as_deref());
        let provider = label
            .and_then(|l| self.providers.get(l))
            .ok_or_else(|| RunError::MissingProvider {
                step: step.id.clone(),
            })?;

        // Model input: resume a tool-call round trip when the context carries
        // answered $call: variables, otherwise render the prompt template.
        let call_results = collect_call_results(task.context.variables());
        let resuming = !call_results.is_empty();
        let conversation = if resuming {
            function_response_prompt(&call_results)
        } else {
            let render_vars = self.render_vars(shared, &task.context);
            self.formatter
                .format(&step.prompt, &Value::Object(render_vars), provider.mime_types())
                .map_err(|source| RunError::Format {
                    step: step.id.clone(),
                    source,
                })?
        };

        let mut invocation = InvocationContext::new(shared.cancel.clone());
        if let Some(name) = step.session.as_ref() {
            if let Some(record) = self.sessions.get(name) {
                if record.provider != provider.name() {
                    tracing::warn!(
                        session = name.as_str(),
                        opened_by = record.provider.as_str(),
                        "session was opened by a different provider"
                    );
                }
                invocation = invocation.with_session(record.handle.clone());
            }
        }

        let prepared =
            provider
                .prepare(&conversation, &invocation)
                .map_err(|source| RunError::Step {
                    step: step.id.clone(),
                    source,
                })?;
        let key = cache_key(
            provider.name(),
            &prepared.request,
            shared.cache_extras.as_ref(),
            run_count,
        );

        let cached = match &self.cache {
            Some(cache) => cache.get(&key).await,
            None => None,
        };
        let response = match cached {
            Some(raw) => {
                tracing::debug!(step = instance.as_str(), "cache hit");
                ModelResponse::new(raw)
            }
            None => {
                let _permit = match provider.concurrency_limit() {
                    Some(limit) => {
                        let semaphore = self
                            .semaphores
                            .entry(provider.name().to_string())
                            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
                            .clone();
                        match semaphore.acquire_owned().await {
                            Ok(permit) => Some(permit),
                            Err(_) => return Err(RunError::Aborted),
                        }
                    }
                    None => None,
                };
                let response = self
                    .stream_invocation(shared, provider, prepared, invocation, &instance, &step)
                    .await?;
                if let Some(cache) = &self.cache {
                    cache.put(&key, response.raw.clone()).await;
                }
                response
            }
        };

        {
            *self.usage.lock().await += provider.extract_token_usage(&response);
        }

        match (&step.session, response.session.clone()) {
            (Some(name), Some(handle)) => {
                self.sessions.insert(
                    name.clone(),
                    SessionRecord {
                        provider: provider.name().to_string(),
                        handle,
                    },
                );
            }
            (None, Some(handle)) => {
                if let Err(err) = provider.close_session(handle).await {
                    tracing::warn!(
                        step = step.id.as_str(),
                        error = %err,
                        "failed to close transient session"
                    );
                }
            }
            _ => {}
        }

        let output = provider
            .extract_output(&response)
            .map_err(|source| RunError::Step {
                step: step.id.clone(),
                source,
            })?;

        let entry = HistoryEntry {
            step: instance,
            prompt: conversation.parts(),
            output: output.clone(),
        };
        {
            let mut history = self.history.lock().await;
            *history = ordered_merge(
                history.as_slice(),
                &[entry.clone()],
                HistoryEntry::canonical_cmp,
            );
        }

        let mut context = task.context.clone();
        if resuming {
            // The round trip is resolved; its synthetic variables must not
            // leak into downstream prompt builds.
            context.variables.retain(|k, _| !k.starts_with(CALL_VAR_PREFIX));
        }
        context.record(entry);

        let calls = collect_function_calls(&output);
        if !calls.is_empty() && step.session.is_some() {
            self.delegate_calls(shared, &task, &step, context, calls).await
        } else {
            apply_output_vars(&mut context, &step, &output);
            if shared.cancel.is_cancelled() {
                return Err(RunError::Aborted);
            }
            let transition = self
                .state
                .lock()
                .await
                .mark_complete(&step, &shared.vars, &context)?;
            self.apply_transition(shared, transition, &task, &step, &context, &output)
                .await
        }
    }

    async fn stream_invocation(
        &self,
        shared: &RunShared,
        provider: &BoxModelProvider,
        prepared: PreparedRequest,
        invocation: InvocationContext,
        instance: &str,
        step: &Step,
    ) -> Result<ModelResponse, RunError> {
        let mut stream = provider.invoke(prepared, invocation);
        let mut final_response = None;
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => return Err(RunError::Aborted),
                event = stream.next() => match event {
                    None => break,
                    Some(Ok(ProviderEvent::Delta { text })) => {
                        let _ = shared
                            .updates
                            .send(RunUpdate {
                                instance: instance.to_string(),
                                chunk: text,
                            })
                            .await;
                    }
                    Some(Ok(ProviderEvent::Completed { response })) => {
                        final_response = Some(response);
                    }
                    Some(Err(source)) => {
                        return Err(RunError::Step {
                            step: step.id.clone(),
                            source,
                        })
                    }
                }
            }
        }
        final_response.ok_or_else(|| RunError::Step {
            step: step.id.clone(),
            source: ProviderError::Stream("stream ended without a final response".to_string()),
        })
    }

    fn render_vars(&self, shared: &RunShared, context: &ExecutionContext) -> Map<String, Value> {
        let mut vars = overlay_variables(&shared.vars, context.variables());
        vars.insert(
            "$history".to_string(),
            serde_json::to_value(&context.history).unwrap_or(Value::Null),
        );
        vars
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn apply_transition(
        self: &Arc<Self>,
        shared: &Arc<RunShared>,
        transition: Transition<ExecutionContext>,
        task: &StepTask,
        step: &Step,
        context: &ExecutionContext,
        output: &[ContentPart],
    ) -> Result<(), RunError> {
        if transition.is_leaf {
            return match &task.reply_to {
                Some(token) => self.publish_reply(shared, step, context, token).await,
                None => self.record_result(shared, output).await,
            };
        }
        self.enqueue_ready(shared, transition.next, task.reply_to.clone())
            .await;
        Ok(())
    }

    async fn enqueue_ready(
        self: &Arc<Self>,
        shared: &Arc<RunShared>,
        ready: Vec<ReadyStep<ExecutionContext>>,
        inherited: Option<String>,
    ) {
        for r in ready {
            let reply_to = {
                let overrides = self.reply_overrides.lock().await;
                match overrides.get(&r.step.id) {
                    Some(stored) => stored.clone(),
                    None => inherited.clone(),
                }
            };
            self.enqueue_task(
                shared,
                StepTask {
                    step: r.step,
                    context: r.context,
                    reply_to,
                },
            );
        }
    }

    /// A call-triggered branch finished: publish its final context under the
    /// per-call token so the waiting resume step can fan back in.
    async fn publish_reply(
        self: &Arc<Self>,
        shared: &Arc<RunShared>,
        step: &Step,
        context: &ExecutionContext,
        token: &str,
    ) -> Result<(), RunError> {
        let mut reply_ctx = context.clone();
        let mut payload = reply_ctx
            .variables
            .get(token)
            .cloned()
            .unwrap_or_else(|| json!({}));
        let answer = reply_ctx
            .variables
            .get("$output")
            .cloned()
            .unwrap_or(Value::Null);
        match &mut payload {
            Value::Object(fields) => {
                fields.insert("output".to_string(), answer);
            }
            _ => payload = json!({ "output": answer }),
        }
        reply_ctx.set_var(token.to_string(), payload);

        let stand_in = Step::new(format!("{}::reply", step.id)).publishes(token.to_string());
        if shared.cancel.is_cancelled() {
            return Err(RunError::Aborted);
        }
        let transition = self
            .state
            .lock()
            .await
            .mark_complete(&stand_in, &shared.vars, &reply_ctx)?;
        self.enqueue_ready(shared, transition.next, None).await;
        Ok(())
    }

    /// Terminal leaf: validate single-result and quiescence invariants, then
    /// record the output.
    async fn record_result(
        &self,
        shared: &Arc<RunShared>,
        output: &[ContentPart],
    ) -> Result<(), RunError> {
        let remaining = shared.queue.remaining();
        let mut outcome = self.outcome.lock().await;
        if outcome.is_some() {
            return Err(RunError::MultipleLeaves);
        }
        if remaining > 1 {
            return Err(RunError::LeafWhileRunning { remaining });
        }
        *outcome = Some(Ok(output.to_vec()));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tool-call delegation
    // -----------------------------------------------------------------------

    /// Turn one model turn containing function calls into independently
    /// schedulable sub-branches.
    ///
    /// A virtual resume step is registered whose dependencies are one
    /// synthetic token per call plus a completion token. Each call fires a
    /// nested transition through a synthetic trigger publishing the
    /// function-name token, unlocking the subscriber steps that answer it;
    /// those branches carry a reply obligation back to the per-call token.
    /// The original step then completes by publishing the completion token
    /// instead of its own output token.
    async fn delegate_calls(
        self: &Arc<Self>,
        shared: &Arc<RunShared>,
        task: &StepTask,
        step: &Step,
        base: ExecutionContext,
        calls: Vec<FunctionCall>,
    ) -> Result<(), RunError> {
        let suffix = self.suffix.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let resume_token = format!("$resume:{suffix}");
        let resume_id = format!("{}::resume::{}", step.id, suffix);

        let call_tokens: Vec<String> = calls
            .iter()
            .map(|call| format!("{CALL_VAR_PREFIX}{}:{}", call.name, suffix))
            .collect();

        let mut deps = call_tokens.clone();
        deps.push(resume_token.clone());
        let mut resume = Step::new(resume_id.clone()).with_deps(deps);
        resume.output_as = step.output_as.clone();
        resume.provider_label = step.provider_label.clone();
        resume.session = step.session.clone();

        self.state.lock().await.register_step(resume)?;
        self.reply_overrides
            .lock()
            .await
            .insert(resume_id, task.reply_to.clone());

        for (call, token) in calls.iter().zip(call_tokens.iter()) {
            let mut trigger_ctx = base.clone();
            trigger_ctx.set_var(
                token.clone(),
                json!({
                    "id": call.id,
                    "name": call.name,
                    "arguments": call.arguments,
                }),
            );

            let trigger = Step::new(format!("{}::call::{}::{}", step.id, call.name, suffix))
                .publishes(call.name.clone());
            if shared.cancel.is_cancelled() {
                return Err(RunError::Aborted);
            }
            let transition = self
                .state
                .lock()
                .await
                .mark_complete(&trigger, &shared.vars, &trigger_ctx)?;
            if transition.next.is_empty() {
                return Err(RunError::UnansweredCall {
                    step: step.id.clone(),
                    name: call.name.clone(),
                });
            }
            for ready in transition.next {
                self.enqueue_task(
                    shared,
                    StepTask {
                        step: ready.step,
                        context: ready.context,
                        reply_to: Some(token.clone()),
                    },
                );
            }
        }

        let mut stand_in = step.clone();
        stand_in.output_as = Some(resume_token);
        if shared.cancel.is_cancelled() {
            return Err(RunError::Aborted);
        }
        let transition = self
            .state
            .lock()
            .await
            .mark_complete(&stand_in, &shared.vars, &base)?;
        self.enqueue_ready(shared, transition.next, task.reply_to.clone())
            .await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extend the context with the step's published output: `$output` always,
/// the output token when declared, and the fields of a single structured
/// output overlaid key-wise (this is how model output drives loop counters
/// and conditions).
fn apply_output_vars(context: &mut ExecutionContext, step: &Step, output: &[ContentPart]) {
    if let [ContentPart::Structured {
        value: Value::Object(fields),
    }] = output
    {
        for (k, v) in fields {
            context.variables.insert(k.clone(), v.clone());
        }
    }
    let value = output_to_value(output);
    if let Some(token) = &step.output_as {
        context.variables.insert(token.clone(), value.clone());
    }
    context.variables.insert("$output".to_string(), value);
}

fn output_to_value(output: &[ContentPart]) -> Value {
    match output {
        [ContentPart::Text { text }] => Value::String(text.clone()),
        [ContentPart::Structured { value }] => value.clone(),
        parts => serde_json::to_value(parts).unwrap_or(Value::Null),
    }
}

fn collect_function_calls(output: &[ContentPart]) -> Vec<FunctionCall> {
    output
        .iter()
        .filter_map(|part| match part {
            ContentPart::FunctionCall {
                id,
                name,
                arguments,
            } => Some(FunctionCall {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Answered round-trip variables in the context, sorted by token for a
/// deterministic response order.
fn collect_call_results(vars: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut keyed: Vec<(&String, (String, Value))> = vars
        .iter()
        .filter(|(k, _)| k.starts_with(CALL_VAR_PREFIX))
        .filter_map(|(k, v)| {
            let output = v.get("output")?.clone();
            let name = v.get("name").and_then(Value::as_str)?.to_string();
            Some((k, (name, output)))
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(b.0));
    keyed.into_iter().map(|(_, r)| r).collect()
}

fn function_response_prompt(results: &[(String, Value)]) -> ConversationPrompt {
    let parts = results
        .iter()
        .map(|(name, output)| ContentPart::FunctionResponse {
            name: name.clone(),
            output: output.clone(),
        })
        .collect();
    ConversationPrompt::new(vec![Message::tool(parts)])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
