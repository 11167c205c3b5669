//! End-to-end pipeline runs against scripted stub collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use promptweave_core::provider::ProviderStream;
use promptweave_core::{
    BoxModelCache, BoxModelProvider, InvocationContext, JexlPredicate, MemoryCache, ModelProvider,
    PipelineRunner, ProviderRegistry, RunContext, SchedulerError, SimpleFormatter, Step,
};
use promptweave_types::content::{ContentPart, ConversationPrompt, OutputValue};
use promptweave_types::error::ProviderError;
use promptweave_types::model::{
    ModelResponse, PreparedRequest, ProviderEvent, SessionHandle, TokenUsage,
};
use promptweave_types::result::PipelineResult;

// ---------------------------------------------------------------------------
// Stub provider
// ---------------------------------------------------------------------------

type Script = Arc<dyn Fn(&ConversationPrompt) -> Result<Vec<ContentPart>, ProviderError> + Send + Sync>;

/// Provider whose behavior is a function of the rendered conversation.
struct StubProvider {
    script: Script,
    issue_sessions: bool,
    stream_deltas: bool,
    delay: Option<Duration>,
    slow_prompt: Option<(String, Duration)>,
    invocations: Arc<AtomicUsize>,
}

impl StubProvider {
    fn new(script: Script) -> Self {
        Self {
            script,
            issue_sessions: false,
            stream_deltas: false,
            delay: None,
            slow_prompt: None,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn with_sessions(mut self) -> Self {
        self.issue_sessions = true;
        self
    }

    fn with_deltas(mut self) -> Self {
        self.stream_deltas = true;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn with_slow_prompt(mut self, prompt: impl Into<String>, delay: Duration) -> Self {
        self.slow_prompt = Some((prompt.into(), delay));
        self
    }

    fn invocation_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.invocations)
    }
}

impl ModelProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    fn prepare(
        &self,
        conversation: &ConversationPrompt,
        _invocation: &InvocationContext,
    ) -> Result<PreparedRequest, ProviderError> {
        Ok(PreparedRequest {
            request: serde_json::to_value(conversation)
                .map_err(|e| ProviderError::Request(e.to_string()))?,
        })
    }

    fn invoke(&self, prepared: PreparedRequest, _invocation: InvocationContext) -> ProviderStream {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let conversation: ConversationPrompt =
            serde_json::from_value(prepared.request).unwrap_or_default();

        let mut events = Vec::new();
        match (self.script)(&conversation) {
            Ok(parts) => {
                if self.stream_deltas {
                    for part in &parts {
                        if let Some(text) = part.as_text() {
                            events.push(Ok(ProviderEvent::Delta {
                                text: text.to_string(),
                            }));
                        }
                    }
                }
                let mut response = ModelResponse::new(json!({ "parts": parts }));
                if self.issue_sessions {
                    response = response.with_session(SessionHandle(json!("stub-session")));
                }
                events.push(Ok(ProviderEvent::Completed { response }));
            }
            Err(err) => events.push(Err(err)),
        }

        let delay = self.delay.or_else(|| {
            self.slow_prompt
                .as_ref()
                .filter(|(prompt, _)| *prompt == prompt_text(&conversation))
                .map(|(_, delay)| *delay)
        });
        match delay {
            Some(delay) => Box::pin(stream::iter(events).then(move |event| async move {
                tokio::time::sleep(delay).await;
                event
            })),
            None => Box::pin(stream::iter(events)),
        }
    }

    fn extract_output(&self, response: &ModelResponse) -> Result<Vec<ContentPart>, ProviderError> {
        serde_json::from_value(response.raw.get("parts").cloned().unwrap_or(json!([])))
            .map_err(|e| ProviderError::Extraction(e.to_string()))
    }

    fn extract_token_usage(&self, _response: &ModelResponse) -> TokenUsage {
        TokenUsage::new(10, 5)
    }

    async fn close_session(&self, _session: SessionHandle) -> Result<(), ProviderError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prompt_text(conversation: &ConversationPrompt) -> String {
    conversation
        .messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| p.as_text())
        .collect::<Vec<_>>()
        .join(" ")
}

fn has_function_responses(conversation: &ConversationPrompt) -> bool {
    conversation
        .messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .any(|p| matches!(p, ContentPart::FunctionResponse { .. }))
}

/// Script mapping exact rendered prompts to outputs.
fn scripted(entries: Vec<(&'static str, Vec<ContentPart>)>) -> Script {
    Arc::new(move |conversation| {
        let text = prompt_text(conversation);
        entries
            .iter()
            .find(|(prompt, _)| *prompt == text)
            .map(|(_, parts)| parts.clone())
            .ok_or_else(|| ProviderError::Request(format!("unscripted prompt: '{text}'")))
    })
}

fn make_runner(steps: Vec<Step>, provider: StubProvider) -> Arc<PipelineRunner> {
    let mut registry = ProviderRegistry::new();
    registry.register("stub", BoxModelProvider::new(provider));
    Arc::new(
        PipelineRunner::new(steps, registry, Arc::new(SimpleFormatter::new()))
            .unwrap()
            .with_default_provider("stub"),
    )
}

async fn run_to_result(runner: &Arc<PipelineRunner>, vars: Map<String, Value>) -> PipelineResult {
    let (tx, _rx) = mpsc::channel(64);
    runner.run(vars, RunContext::new(), tx).await.unwrap()
}

fn text(s: &str) -> Vec<ContentPart> {
    vec![ContentPart::text(s)]
}

// ---------------------------------------------------------------------------
// Linear and branching flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_pipeline_produces_single_result() {
    let provider = StubProvider::new(scripted(vec![
        ("first", text("one")),
        ("second", text("final answer")),
    ]));
    let runner = make_runner(
        vec![
            Step::new("a").with_prompt("first"),
            Step::new("b").with_prompt("second"),
        ],
        provider,
    );

    let result = run_to_result(&runner, Map::new()).await;

    assert_eq!(result.error, None);
    assert_eq!(result.output, Some(OutputValue::Text("final answer".into())));
    assert_eq!(result.history.len(), 2);
    assert_eq!(result.token_usage, TokenUsage::new(20, 10));
}

#[tokio::test]
async fn fan_in_receives_merged_contexts() {
    let provider = StubProvider::new(scripted(vec![
        ("left", text("L")),
        ("right", text("R")),
        ("join L R", text("joined")),
    ]));
    let runner = make_runner(
        vec![
            Step::new("left").with_prompt("left").publishes("l"),
            Step::new("right")
                .with_deps(Vec::<String>::new())
                .with_prompt("right")
                .publishes("r"),
            Step::new("join")
                .with_deps(["l", "r"])
                .with_prompt("join {{ l }} {{ r }}"),
        ],
        provider,
    );

    let result = run_to_result(&runner, Map::new()).await;

    assert_eq!(result.error, None);
    assert_eq!(result.output, Some(OutputValue::Text("joined".into())));
    assert_eq!(result.history.len(), 3);
}

#[tokio::test]
async fn template_renders_initial_variables() {
    let provider = StubProvider::new(scripted(vec![("about rust", text("ok"))]));
    let runner = make_runner(
        vec![Step::new("only").with_prompt("about {{ topic }}")],
        provider,
    );

    let mut vars = Map::new();
    vars.insert("topic".to_string(), json!("rust"));
    let result = run_to_result(&runner, vars).await;

    assert_eq!(result.error, None);
    assert_eq!(result.output, Some(OutputValue::Text("ok".into())));
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn self_loop_runs_until_condition_fails() {
    let structured = |n: i64| {
        vec![ContentPart::Structured {
            value: json!({ "n": n }),
        }]
    };
    let provider = StubProvider::new(scripted(vec![
        ("seed", structured(1)),
        ("loop 1", structured(2)),
        ("loop 2", structured(3)),
    ]));
    let runner = make_runner(
        vec![
            Step::new("seed").with_prompt("seed").publishes("t"),
            Step::new("again")
                .with_deps(["t"])
                .publishes("t")
                .with_prompt("loop {{ n }}")
                .when(Arc::new(JexlPredicate::new("n < 3"))),
        ],
        provider,
    );

    let mut vars = Map::new();
    vars.insert("n".to_string(), json!(0));
    let result = run_to_result(&runner, vars).await;

    assert_eq!(result.error, None);
    assert_eq!(
        result.output,
        Some(OutputValue::Parts(vec![ContentPart::Structured {
            value: json!({ "n": 3 })
        }]))
    );
    let instances: Vec<&str> = result.history.iter().map(|e| e.step.as_str()).collect();
    assert_eq!(instances, vec!["again", "again#2", "seed"]);
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn provider_error_becomes_terminal_error() {
    let provider = StubProvider::new(Arc::new(|conversation| {
        let prompt = prompt_text(conversation);
        if prompt == "bad" {
            Err(ProviderError::Request("upstream 500".to_string()))
        } else {
            Ok(vec![ContentPart::text("slow ok")])
        }
    }))
    .with_slow_prompt("slow", Duration::from_millis(50));
    let runner = make_runner(
        vec![
            Step::new("bad").with_prompt("bad"),
            Step::new("slow")
                .with_deps(Vec::<String>::new())
                .with_prompt("slow"),
        ],
        provider,
    );

    let result = run_to_result(&runner, Map::new()).await;

    assert!(result.output.is_none());
    let error = result.error.expect("run must fail");
    assert!(error.contains("bad"), "got: {error}");
    assert!(error.contains("upstream 500"), "got: {error}");
}

#[tokio::test]
async fn concurrent_leaves_are_fatal() {
    let provider = StubProvider::new(scripted(vec![
        ("one", text("1")),
        ("two", text("2")),
    ]))
    .with_delay(Duration::from_millis(5));
    let runner = make_runner(
        vec![
            Step::new("one").with_prompt("one"),
            Step::new("two")
                .with_deps(Vec::<String>::new())
                .with_prompt("two"),
        ],
        provider,
    );

    let result = run_to_result(&runner, Map::new()).await;

    assert!(result.output.is_none());
    let error = result.error.expect("two terminal branches must fail the run");
    assert!(
        error.contains("result") || error.contains("leaves"),
        "got: {error}"
    );
}

#[tokio::test]
async fn missing_provider_is_fatal() {
    let provider = StubProvider::new(scripted(vec![]));
    let mut registry = ProviderRegistry::new();
    registry.register("stub", BoxModelProvider::new(provider));
    // No default provider; the step names a label that is not registered.
    let runner = Arc::new(
        PipelineRunner::new(
            vec![Step::new("a").with_prompt("x").via_provider("missing")],
            registry,
            Arc::new(SimpleFormatter::new()),
        )
        .unwrap(),
    );

    let result = run_to_result(&runner, Map::new()).await;
    let error = result.error.expect("missing provider must fail the run");
    assert!(error.contains("no provider registered"), "got: {error}");
}

#[tokio::test]
async fn no_starting_steps_is_a_configuration_error() {
    let provider = StubProvider::new(scripted(vec![]));
    let runner = make_runner(
        vec![Step::new("waiting").with_deps(["never_published"])],
        provider,
    );

    let (tx, _rx) = mpsc::channel(8);
    let err = runner
        .run(Map::new(), RunContext::new(), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NoStartingSteps));
}

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_mid_run_stops_scheduling() {
    let provider = StubProvider::new(scripted(vec![
        ("first", text("one")),
        ("second", text("never")),
    ]))
    .with_delay(Duration::from_millis(100));
    let invocations = provider.invocation_counter();
    let runner = make_runner(
        vec![
            Step::new("a").with_prompt("first"),
            Step::new("b").with_prompt("second"),
        ],
        provider,
    );

    let abort = CancellationToken::new();
    let run_ctx = RunContext {
        abort: abort.clone(),
        cache_extras: None,
    };
    let handle = runner.spawn(Map::new(), run_ctx);

    tokio::time::sleep(Duration::from_millis(10)).await;
    abort.cancel();

    let result = handle.result.await.unwrap().unwrap();
    assert!(result.output.is_none());
    assert_eq!(result.error.as_deref(), Some("run aborted"));
    assert_eq!(
        invocations.load(Ordering::SeqCst),
        1,
        "the second step must never be invoked"
    );
}

// ---------------------------------------------------------------------------
// Streaming updates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn updates_are_tagged_with_step_instance() {
    let provider = StubProvider::new(scripted(vec![("hello", text("streamed text"))]))
        .with_deltas();
    let runner = make_runner(vec![Step::new("only").with_prompt("hello")], provider);

    let mut handle = runner.spawn(Map::new(), RunContext::new());
    let mut updates = Vec::new();
    while let Some(update) = handle.updates.recv().await {
        updates.push(update);
    }
    let result = handle.result.await.unwrap().unwrap();

    assert_eq!(result.error, None);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].instance, "only");
    assert_eq!(updates[0].chunk, "streamed text");
}

// ---------------------------------------------------------------------------
// Caching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_runs_share_cached_responses() {
    let cache = Arc::new(MemoryCache::new());
    let mut total_invocations = 0;

    for _ in 0..2 {
        let provider = StubProvider::new(scripted(vec![("hello", text("cached ok"))]));
        let invocations = provider.invocation_counter();
        let mut registry = ProviderRegistry::new();
        registry.register("stub", BoxModelProvider::new(provider));
        let runner = Arc::new(
            PipelineRunner::new(
                vec![Step::new("only").with_prompt("hello")],
                registry,
                Arc::new(SimpleFormatter::new()),
            )
            .unwrap()
            .with_default_provider("stub")
            .with_cache(BoxModelCache::new(Arc::clone(&cache))),
        );

        let result = run_to_result(&runner, Map::new()).await;
        assert_eq!(result.error, None);
        assert_eq!(result.output, Some(OutputValue::Text("cached ok".into())));
        total_invocations += invocations.load(Ordering::SeqCst);
    }

    assert_eq!(total_invocations, 1, "the second run must hit the cache");
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn cache_extras_partition_the_cache() {
    let cache = Arc::new(MemoryCache::new());
    for seed in [1, 2] {
        let provider = StubProvider::new(scripted(vec![("hello", text("ok"))]));
        let mut registry = ProviderRegistry::new();
        registry.register("stub", BoxModelProvider::new(provider));
        let runner = Arc::new(
            PipelineRunner::new(
                vec![Step::new("only").with_prompt("hello")],
                registry,
                Arc::new(SimpleFormatter::new()),
            )
            .unwrap()
            .with_default_provider("stub")
            .with_cache(BoxModelCache::new(Arc::clone(&cache))),
        );
        let (tx, _rx) = mpsc::channel(8);
        let run_ctx = RunContext::new().with_cache_extras(json!({ "seed": seed }));
        runner.run(Map::new(), run_ctx, tx).await.unwrap();
    }
    assert_eq!(cache.len(), 2, "different extras must not share entries");
}

// ---------------------------------------------------------------------------
// Tool-call round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tool_calls_fan_out_and_resume() {
    let script: Script = Arc::new(|conversation| {
        if has_function_responses(conversation) {
            return Ok(vec![ContentPart::text("It is sunny at noon")]);
        }
        match prompt_text(conversation).as_str() {
            "ask" => Ok(vec![
                ContentPart::FunctionCall {
                    id: "c1".to_string(),
                    name: "get_weather".to_string(),
                    arguments: json!({ "city": "Austin" }),
                },
                ContentPart::FunctionCall {
                    id: "c2".to_string(),
                    name: "get_time".to_string(),
                    arguments: json!({}),
                },
            ]),
            "weather" => Ok(vec![ContentPart::text("sunny")]),
            "time" => Ok(vec![ContentPart::text("noon")]),
            "report It is sunny at noon" => Ok(vec![ContentPart::text("final report")]),
            other => Err(ProviderError::Request(format!("unscripted prompt: '{other}'"))),
        }
    });
    let provider = StubProvider::new(script).with_sessions();
    let runner = make_runner(
        vec![
            Step::new("ask")
                .with_prompt("ask")
                .in_session("chat")
                .publishes("reply"),
            Step::new("weather_tool")
                .with_deps(["get_weather"])
                .with_prompt("weather"),
            Step::new("time_tool")
                .with_deps(["get_time"])
                .with_prompt("time"),
            Step::new("report")
                .with_deps(["reply"])
                .with_prompt("report {{ reply }}"),
        ],
        provider,
    );

    let result = run_to_result(&runner, Map::new()).await;

    assert_eq!(result.error, None);
    assert_eq!(result.output, Some(OutputValue::Text("final report".into())));

    let instances: Vec<&str> = result.history.iter().map(|e| e.step.as_str()).collect();
    assert!(instances.contains(&"ask"));
    assert!(instances.contains(&"weather_tool"));
    assert!(instances.contains(&"time_tool"));
    assert!(instances.contains(&"report"));
    assert!(
        instances.iter().any(|i| i.starts_with("ask::resume::")),
        "the resumed turn must appear in history: {instances:?}"
    );
    assert_eq!(result.history.len(), 5);
    // ask, two tools, resume, report
    assert_eq!(result.token_usage, TokenUsage::new(50, 25));
}

#[tokio::test]
async fn unanswered_function_call_is_fatal() {
    let script: Script = Arc::new(|conversation| {
        match prompt_text(conversation).as_str() {
            "ask" => Ok(vec![ContentPart::FunctionCall {
                id: "c1".to_string(),
                name: "nobody_home".to_string(),
                arguments: json!({}),
            }]),
            other => Err(ProviderError::Request(format!("unscripted prompt: '{other}'"))),
        }
    });
    let provider = StubProvider::new(script).with_sessions();
    let runner = make_runner(
        vec![Step::new("ask").with_prompt("ask").in_session("chat")],
        provider,
    );

    let result = run_to_result(&runner, Map::new()).await;

    assert!(result.output.is_none());
    let error = result.error.expect("unanswered call must fail the run");
    assert!(error.contains("nobody_home"), "got: {error}");
    assert!(error.contains("no subscriber"), "got: {error}");
}

// ---------------------------------------------------------------------------
// Determinism under completion-order variance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fan_in_result_is_independent_of_completion_order() {
    // The slow side flips between branches; the merged context and the
    // terminal output must not.
    for slow in ["left", "right"] {
        let provider = StubProvider::new(scripted(vec![
            ("left", text("L")),
            ("right", text("R")),
            ("join L R", text("joined")),
        ]))
        .with_slow_prompt(slow, Duration::from_millis(30));
        let runner = make_runner(
            vec![
                Step::new("left").with_prompt("left").publishes("l"),
                Step::new("right")
                    .with_deps(Vec::<String>::new())
                    .with_prompt("right")
                    .publishes("r"),
                Step::new("join")
                    .with_deps(["l", "r"])
                    .with_prompt("join {{ l }} {{ r }}"),
            ],
            provider,
        );
        let result = run_to_result(&runner, Map::new()).await;
        assert_eq!(result.error, None, "slow branch: {slow}");
        assert_eq!(result.output, Some(OutputValue::Text("joined".into())));
    }
}
