use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::json;
use tempfile::tempdir;

use crate::classifier::*;
use crate::cli::*;
use crate::combine::*;
use crate::config::*;
use crate::dispatch::*;
use crate::engine::*;
use crate::error::*;
use crate::evaluate::*;
use crate::registry::*;
use crate::server::*;
use crate::session::*;
use crate::telemetry::*;

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".enso/config.toml".to_string(),
        session_id: "test-session".to_string(),
        default_agent: "general".to_string(),
        classifier: ClassifierMode::Rules,
        agent_timeout_secs: 5,
        scorer_timeout_secs: 5,
        history_max_turns: 20,
        history_max_chars: 400,
        telemetry_enabled: false,
        telemetry_path: ".enso/test-telemetry.jsonl".to_string(),
    }
}

fn test_telemetry(cfg: &RuntimeConfig) -> TelemetrySink {
    TelemetrySink::new(cfg, "test".to_string())
}

fn descriptor(id: &str, tool_name: &str, terms: &[&str]) -> AgentDescriptor {
    AgentDescriptor {
        id: id.to_string(),
        tool_name: tool_name.to_string(),
        description: format!("{id} test agent"),
        trigger_terms: terms.iter().map(|t| t.to_string()).collect(),
    }
}

struct EchoHandler {
    text: String,
    usage: TokenUsage,
    delay_ms: u64,
}

impl EchoHandler {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            usage: TokenUsage {
                input_tokens: 1000,
                output_tokens: 500,
            },
            delay_ms: 0,
        }
    }

    fn delayed(text: &str, delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::new(text)
        }
    }
}

#[async_trait]
impl AgentHandler for EchoHandler {
    async fn invoke(&self, _invocation: &AgentInvocation) -> Result<AgentReply> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        Ok(AgentReply {
            text: self.text.clone(),
            usage: self.usage,
        })
    }
}

struct FailingHandler {
    note: String,
}

#[async_trait]
impl AgentHandler for FailingHandler {
    async fn invoke(&self, _invocation: &AgentInvocation) -> Result<AgentReply> {
        Err(anyhow::anyhow!("{}", self.note))
    }
}

fn scripted_registry() -> AgentRegistry {
    let catalog: Vec<(AgentDescriptor, Arc<dyn AgentHandler>)> = vec![
        (
            descriptor("nasa", "nasa_query", &["asteroid", "nasa"]),
            Arc::new(EchoHandler::new("Asteroid flyby logged.")),
        ),
        (
            descriptor("weather", "weather_lookup", &["weather"]),
            Arc::new(EchoHandler::new("Sunny in Berlin, 21 degrees.")),
        ),
        (
            descriptor("sql", "sql_query", &["orders"]),
            Arc::new(EchoHandler::new("There are 830 orders.")),
        ),
        (
            descriptor("broken", "broken_tool", &["broken"]),
            Arc::new(FailingHandler {
                note: "boom".to_string(),
            }),
        ),
        (
            descriptor("slow", "slow_tool", &["slow"]),
            Arc::new(EchoHandler::delayed("slow answer", 40)),
        ),
        (
            descriptor("general", "general_assistant", &[]),
            Arc::new(EchoHandler::new("General reply.")),
        ),
    ];
    AgentRegistry::new(catalog, "general").expect("test registry should build")
}

struct FixedScorer {
    metric: &'static str,
    score: f64,
}

#[async_trait]
impl MetricScorer for FixedScorer {
    fn metric(&self) -> &str {
        self.metric
    }

    async fn score(&self, _query: &str, _answer: &str) -> Result<MetricJudgment> {
        Ok(MetricJudgment {
            score: self.score,
            reason: format!("fixed {}", self.score),
        })
    }
}

struct ErrorScorer {
    metric: &'static str,
}

#[async_trait]
impl MetricScorer for ErrorScorer {
    fn metric(&self) -> &str {
        self.metric
    }

    async fn score(&self, _query: &str, _answer: &str) -> Result<MetricJudgment> {
        Err(anyhow::anyhow!("judge backend offline"))
    }
}

fn test_engine(registry: AgentRegistry, scorers: Vec<Arc<dyn MetricScorer>>) -> Arc<OrchestrationEngine> {
    let registry = Arc::new(registry);
    let cfg = base_cfg();
    Arc::new(OrchestrationEngine::new(
        registry.clone(),
        Arc::new(SessionStore::new()),
        Classifier::rules(),
        Dispatcher::new(registry, Duration::from_secs(5)),
        Evaluator::new(scorers, Duration::from_secs(5)),
        test_telemetry(&cfg),
        20,
        400,
    ))
}

struct ScriptedModel {
    output: Option<String>,
}

#[async_trait]
impl ReasoningModel for ScriptedModel {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        match &self.output {
            Some(text) => Ok(text.clone()),
            None => Err(anyhow::anyhow!("routing model offline")),
        }
    }
}

// --- classifier ---

#[test]
fn rules_route_keywords_in_registry_order() {
    let registry = scripted_registry();
    let selected = RuleBasedClassifier.classify(
        &registry,
        "Any asteroids near Earth, and what's the weather?",
        None,
    );
    assert_eq!(selected, vec!["nasa".to_string(), "weather".to_string()]);
}

#[test]
fn rules_select_weather_then_traffic_for_mixed_query() {
    let registry = builtin_registry("general").expect("builtin registry");
    let selected = RuleBasedClassifier.classify(
        &registry,
        "What's the weather in Boston and the traffic to Cambridge?",
        None,
    );
    assert_eq!(selected, vec!["weather".to_string(), "traffic".to_string()]);
}

#[test]
fn rules_route_keyword_aliases_and_shorthands() {
    let registry = builtin_registry("general").expect("builtin registry");

    assert_eq!(
        RuleBasedClassifier.classify(&registry, "any NEOs visible today?", None),
        vec!["nasa".to_string()]
    );
    assert_eq!(
        RuleBasedClassifier.classify(&registry, "latest JWST images please", None),
        vec!["nasa".to_string()]
    );
    assert_eq!(
        RuleBasedClassifier.classify(&registry, "what does the barometer read?", None),
        vec!["weather".to_string()]
    );
    assert_eq!(
        RuleBasedClassifier.classify(&registry, "draw a donut of orders by shippers", None),
        vec!["sql".to_string(), "viz".to_string()]
    );
}

#[test]
fn rules_rag_prefix_short_circuits() {
    let registry = builtin_registry("general").expect("builtin registry");
    let selected = RuleBasedClassifier.classify(
        &registry,
        "rag: what does the contract say about renewal and weather damage?",
        None,
    );
    assert_eq!(selected, vec!["rag".to_string()]);
}

#[test]
fn rules_route_file_extensions() {
    let registry = builtin_registry("general").expect("builtin registry");

    let with_image = RuleBasedClassifier.classify(&registry, "what is this?", Some("shot.PNG"));
    assert_eq!(with_image[0], "multimodal");

    let with_doc = RuleBasedClassifier.classify(&registry, "summarize this", Some("notes.pdf"));
    assert_eq!(with_doc[0], "rag");
}

#[test]
fn rules_fall_back_to_default_agent() {
    let registry = scripted_registry();
    let selected = RuleBasedClassifier.classify(&registry, "hello there", None);
    assert_eq!(selected, vec!["general".to_string()]);
}

#[test]
fn rules_use_rag_hints_only_without_a_file() {
    let registry = builtin_registry("general").expect("builtin registry");

    let hinted = RuleBasedClassifier.classify(&registry, "search the knowledge base for SSO", None);
    assert!(hinted.contains(&"rag".to_string()));

    let with_file =
        RuleBasedClassifier.classify(&registry, "search the knowledge base", Some("x.pdf"));
    assert_eq!(
        with_file.iter().filter(|id| *id == "rag").count(),
        1,
        "file routing and hints must not duplicate rag"
    );
}

#[test]
fn parse_agent_ids_accepts_messy_model_output() {
    assert_eq!(
        parse_agent_ids("[\"nasa\", \"weather\"]"),
        vec!["nasa".to_string(), "weather".to_string()]
    );
    assert_eq!(
        parse_agent_ids("NASA,\n sql "),
        vec!["nasa".to_string(), "sql".to_string()]
    );
    assert!(parse_agent_ids("  ,, \n").is_empty());
}

#[tokio::test]
async fn model_assisted_drops_unknown_ids_and_dedups() {
    let registry = scripted_registry();
    let model = ModelAssistedClassifier::new(Arc::new(ScriptedModel {
        output: Some("nasa, bogus, nasa, weather".to_string()),
    }));
    let selected = model.classify(&registry, "anything", "", None).await;
    assert_eq!(selected, vec!["nasa".to_string(), "weather".to_string()]);
}

#[tokio::test]
async fn model_assisted_empty_validation_falls_back_to_default() {
    let registry = scripted_registry();
    let model = ModelAssistedClassifier::new(Arc::new(ScriptedModel {
        output: Some("bogus, unknown".to_string()),
    }));
    let selected = model.classify(&registry, "anything", "", None).await;
    assert_eq!(selected, vec!["general".to_string()]);
}

#[tokio::test]
async fn model_error_degrades_to_rule_based_result() {
    let registry = scripted_registry();
    let classifier = Classifier::model(Arc::new(ScriptedModel { output: None }));
    let selected = classifier
        .classify(&registry, "what's the weather like", "", None)
        .await;
    assert_eq!(selected, vec!["weather".to_string()]);
}

// --- dispatch ---

#[tokio::test]
async fn dispatch_preserves_selection_order_under_reversed_completion() {
    let registry = Arc::new(scripted_registry());
    let dispatcher = Dispatcher::new(registry, Duration::from_secs(5));

    let selected = vec!["slow".to_string(), "weather".to_string()];
    let results = dispatcher.dispatch(&selected, "hi", None, "").await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].agent_id, "slow");
    assert_eq!(results[1].agent_id, "weather");
    assert!(results.iter().all(|result| !result.is_err()));
}

#[tokio::test]
async fn dispatch_isolates_failures_with_inline_notice() {
    let registry = Arc::new(scripted_registry());
    let dispatcher = Dispatcher::new(registry, Duration::from_secs(5));

    let selected = vec!["broken".to_string(), "sql".to_string()];
    let results = dispatcher.dispatch(&selected, "orders", None, "").await;

    assert_eq!(results.len(), 2);
    assert!(results[0].is_err());
    assert_eq!(results[0].text(), "⚠ broken agent error: boom");
    assert_eq!(results[0].usage, TokenUsage::default());
    assert_eq!(results[1].outcome, Ok("There are 830 orders.".to_string()));
}

#[tokio::test]
async fn dispatch_times_out_slow_agents_without_delaying_others() {
    let registry = Arc::new(scripted_registry());
    let dispatcher = Dispatcher::new(registry, Duration::from_millis(10));

    let selected = vec!["slow".to_string(), "sql".to_string()];
    let results = dispatcher.dispatch(&selected, "orders", None, "").await;

    assert!(results[0].is_err());
    assert!(results[0].text().contains("timed out"));
    assert!(!results[1].is_err());
}

#[test]
fn usage_totals_and_cost_round_to_six_decimals() {
    let usage = TokenUsage {
        input_tokens: 1000,
        output_tokens: 500,
    };
    assert_eq!(usage.total_tokens(), 1500);
    assert_eq!(usage.estimated_cost(), 0.006);

    let odd = TokenUsage {
        input_tokens: 123,
        output_tokens: 457,
    };
    assert_eq!(odd.estimated_cost(), 0.003902);
}

// --- combine ---

#[test]
fn combine_single_result_is_verbatim() {
    let result = DispatchResult::succeeded(
        "weather".to_string(),
        "Sunny in Berlin, 21 degrees.".to_string(),
        TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
        },
        1.0,
    );
    let combined = combine(std::slice::from_ref(&result));
    assert_eq!(combined.text, "Sunny in Berlin, 21 degrees.");
    assert_eq!(combined.agents, vec!["weather".to_string()]);
    assert_eq!(combined.usage.total_tokens(), 30);
}

#[test]
fn combine_multiple_results_render_ordered_sections() {
    let results = vec![
        DispatchResult::succeeded(
            "nasa".to_string(),
            "Asteroid flyby logged.".to_string(),
            TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            1.0,
        ),
        DispatchResult::failed("broken".to_string(), "boom".to_string(), 1.0),
    ];
    let combined = combine(&results);

    let nasa_at = combined
        .text
        .find("### 🤖 NASA Agent")
        .expect("nasa section present");
    let broken_at = combined
        .text
        .find("### 🤖 BROKEN Agent")
        .expect("broken section present");
    assert!(nasa_at < broken_at, "sections follow selection order");
    assert!(combined.text.contains("\n\n---\n\n"));
    assert!(combined.text.contains("⚠ broken agent error: boom"));
    assert_eq!(combined.usage.total_tokens(), 15);
}

#[test]
fn combine_is_idempotent() {
    let results = vec![
        DispatchResult::succeeded("a".to_string(), "first".to_string(), TokenUsage::default(), 0.0),
        DispatchResult::succeeded("b".to_string(), "second".to_string(), TokenUsage::default(), 0.0),
    ];
    assert_eq!(combine(&results).text, combine(&results).text);
}

#[test]
fn combine_empty_results_yield_notice() {
    let combined = combine(&[]);
    assert!(combined.text.starts_with('⚠'));
    assert!(combined.agents.is_empty());
}

// --- evaluation ---

#[test]
fn scorecard_overall_is_mean_rounded_to_one_decimal() {
    let card = ScoreCard::from_scores(vec![
        MetricScore::scored("relevance", 4.0, "ok".to_string()),
        MetricScore::scored("coherence", 5.0, "ok".to_string()),
        MetricScore::scored("fluency", 3.0, "ok".to_string()),
        MetricScore::scored("groundedness", 2.0, "weak".to_string()),
    ]);
    assert_eq!(card.overall_score, Some(3.5));
    assert_eq!(card.overall_result, "pass");
    assert_eq!(card.scores[3].result, "fail");
}

#[test]
fn scorecard_excludes_errored_metrics_from_mean() {
    let card = ScoreCard::from_scores(vec![
        MetricScore::scored("relevance", 4.0, "ok".to_string()),
        MetricScore::scored("coherence", 5.0, "ok".to_string()),
        MetricScore::errored("fluency", "judge backend offline".to_string()),
        MetricScore::scored("groundedness", 2.0, "weak".to_string()),
    ]);
    // mean of 4, 5, 2
    assert_eq!(card.overall_score, Some(3.7));
    assert_eq!(card.overall_result, "pass");
}

#[test]
fn scorecard_all_errors_has_no_overall_and_fails() {
    let card = ScoreCard::from_scores(
        METRIC_NAMES
            .iter()
            .map(|metric| MetricScore::errored(metric, "offline".to_string()))
            .collect(),
    );
    assert_eq!(card.overall_score, None);
    assert_eq!(card.overall_result, "fail");
}

#[test]
fn metric_scores_clamp_into_range() {
    assert_eq!(
        MetricScore::scored("relevance", 9.0, "".to_string()).score,
        Some(5.0)
    );
    assert_eq!(
        MetricScore::scored("relevance", -3.0, "".to_string()).score,
        Some(1.0)
    );
}

#[tokio::test]
async fn evaluator_marks_errored_scorers_and_keeps_order() {
    let evaluator = Evaluator::new(
        vec![
            Arc::new(FixedScorer {
                metric: "relevance",
                score: 4.0,
            }),
            Arc::new(ErrorScorer { metric: "coherence" }),
            Arc::new(FixedScorer {
                metric: "fluency",
                score: 5.0,
            }),
        ],
        Duration::from_secs(5),
    );

    let card = evaluator.evaluate("question", "answer").await;
    assert_eq!(card.scores.len(), 3);
    assert_eq!(card.scores[0].metric, "relevance");
    assert_eq!(card.scores[1].metric, "coherence");
    assert_eq!(card.scores[1].result, "error");
    assert_eq!(card.scores[1].score, None);
    assert_eq!(card.scores[2].metric, "fluency");
    // mean of 4 and 5
    assert_eq!(card.overall_score, Some(4.5));
}

#[tokio::test]
async fn heuristic_scorers_cover_all_metrics() {
    let evaluator = Evaluator::new(heuristic_scorers(), Duration::from_secs(5));
    let card = evaluator
        .evaluate(
            "weather in Berlin",
            "The weather in Berlin is sunny. Expect 21 degrees all afternoon.",
        )
        .await;

    let metrics = card
        .scores
        .iter()
        .map(|score| score.metric.as_str())
        .collect::<Vec<&str>>();
    assert_eq!(metrics, METRIC_NAMES.to_vec());
    assert!(card.scores.iter().all(|score| score.result != "error"));
    assert!(card.overall_score.is_some());
}

// --- session store ---

#[tokio::test]
async fn session_round_trip_preserves_turn_order() {
    let store = SessionStore::new();
    store.append_turn("s1", Turn::user("T1")).await;
    store
        .append_turn("s1", Turn::assistant("T2", vec!["general".to_string()]))
        .await;
    store.append_turn("s1", Turn::user("T3")).await;

    let history = store.history("s1").await;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].content, "T1");
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].content, "T2");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[2].content, "T3");
}

#[tokio::test]
async fn unseen_session_reads_empty_without_creating_state() {
    let store = SessionStore::new();
    assert!(store.history("never-seen").await.is_empty());
    assert_eq!(store.turn_count("never-seen").await, 0);
    assert!(store.session_ids().await.is_empty());
}

#[tokio::test]
async fn append_exchange_adds_user_then_assistant() {
    let store = SessionStore::new();
    store
        .append_exchange(
            "s1",
            Turn::user("question"),
            Turn::assistant("answer", vec!["sql".to_string()]),
        )
        .await;

    let history = store.history("s1").await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].agents, vec!["sql".to_string()]);
}

#[tokio::test]
async fn concurrent_exchanges_on_one_session_never_interleave() {
    let store = Arc::new(SessionStore::new());

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .append_exchange(
                    "shared",
                    Turn::user(format!("q{i}")),
                    Turn::assistant(format!("a{i}"), Vec::new()),
                )
                .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let history = store.history("shared").await;
    assert_eq!(history.len(), 32);
    for pair in history.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
        // each user turn is immediately followed by its own answer
        assert_eq!(
            pair[0].content.trim_start_matches('q'),
            pair[1].content.trim_start_matches('a')
        );
    }
}

#[tokio::test]
async fn distinct_sessions_do_not_share_history() {
    let store = SessionStore::new();
    store.append_turn("a", Turn::user("for a")).await;
    store.append_turn("b", Turn::user("for b")).await;

    assert_eq!(store.history("a").await.len(), 1);
    assert_eq!(store.history("b").await.len(), 1);
    assert_eq!(
        store.session_ids().await,
        vec!["a".to_string(), "b".to_string()]
    );
}

#[test]
fn history_summary_truncates_and_keeps_most_recent() {
    let long = "x".repeat(500);
    let turns = vec![
        Turn::user("oldest"),
        Turn::assistant("middle", Vec::new()),
        Turn::user(long),
    ];

    let summary = summarize_history(&turns, 2, 400);
    assert!(!summary.contains("oldest"));
    assert!(summary.contains("Assistant: middle"));
    assert!(summary.contains('…'));

    let truncated_line = summary.lines().last().expect("last line");
    // "User: " prefix + 400 kept chars + ellipsis
    assert_eq!(truncated_line.chars().count(), 6 + 400 + 1);
}

// --- engine ---

#[tokio::test]
async fn chat_routes_dispatches_and_persists_one_exchange() {
    let engine = test_engine(scripted_registry(), heuristic_scorers());
    let response = engine
        .chat(ChatRequest::new("What's the weather today?", "sess-1"))
        .await;

    assert_eq!(response.reply, "Sunny in Berlin, 21 degrees.");
    assert_eq!(response.agent, "weather");
    assert_eq!(response.agents_called, vec!["weather".to_string()]);
    assert_eq!(response.session_id, "sess-1");
    assert_eq!(response.metadata.token_usage.total_tokens, 1500);
    assert_eq!(response.metadata.token_usage.estimated_cost, 0.006);

    let history = engine.sessions().history("sess-1").await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "What's the weather today?");
    assert_eq!(history[1].content, response.reply);
    assert_eq!(history[1].agents, response.agents_called);
}

#[tokio::test]
async fn chat_multi_agent_reply_sections_follow_selection_order() {
    let engine = test_engine(scripted_registry(), heuristic_scorers());
    let response = engine
        .chat(ChatRequest::new(
            "Any asteroids today, and how is the weather?",
            "sess-multi",
        ))
        .await;

    assert_eq!(
        response.agents_called,
        vec!["nasa".to_string(), "weather".to_string()]
    );
    assert_eq!(response.agent, "nasa");
    assert!(response.reply.contains("### 🤖 NASA Agent"));
    assert!(response.reply.contains("### 🤖 WEATHER Agent"));
    assert_eq!(response.metadata.token_usage.total_tokens, 3000);
}

#[tokio::test]
async fn chat_failed_agent_degrades_to_inline_notice() {
    let engine = test_engine(scripted_registry(), heuristic_scorers());
    let response = engine
        .chat(ChatRequest::new(
            "the broken thing and my orders",
            "sess-fail",
        ))
        .await;

    assert_eq!(
        response.agents_called,
        vec!["sql".to_string(), "broken".to_string()]
    );
    assert!(response.reply.contains("⚠ broken agent error: boom"));
    assert!(response.reply.contains("There are 830 orders."));
    // failed agents contribute zero usage
    assert_eq!(response.metadata.token_usage.total_tokens, 1500);
}

#[tokio::test]
async fn chat_history_grows_even_when_every_scorer_errors() {
    let scorers: Vec<Arc<dyn MetricScorer>> = vec![
        Arc::new(ErrorScorer { metric: "relevance" }),
        Arc::new(ErrorScorer { metric: "coherence" }),
    ];
    let engine = test_engine(scripted_registry(), scorers);

    let response = engine
        .chat(ChatRequest::new("weather please", "sess-eval"))
        .await;

    assert_eq!(response.metadata.evaluation_scores.overall_score, None);
    assert_eq!(response.metadata.evaluation_scores.overall_result, "fail");
    assert_eq!(response.reply, "Sunny in Berlin, 21 degrees.");
    assert_eq!(engine.sessions().turn_count("sess-eval").await, 2);
}

#[tokio::test]
async fn chat_pinned_agent_bypasses_classification() {
    let engine = test_engine(scripted_registry(), heuristic_scorers());
    let mut request = ChatRequest::new("what's the weather?", "sess-pin");
    request.agent = Some("sql".to_string());

    let response = engine.chat(request).await;
    assert_eq!(response.agents_called, vec!["sql".to_string()]);
    assert_eq!(response.reply, "There are 830 orders.");
}

#[tokio::test]
async fn chat_unknown_pinned_agent_falls_back_to_classification() {
    let engine = test_engine(scripted_registry(), heuristic_scorers());
    let mut request = ChatRequest::new("what's the weather?", "sess-pin2");
    request.agent = Some("nonexistent".to_string());

    let response = engine.chat(request).await;
    assert_eq!(response.agents_called, vec!["weather".to_string()]);
}

#[tokio::test]
async fn chat_later_turn_sees_earlier_history() {
    let engine = test_engine(scripted_registry(), heuristic_scorers());
    engine
        .chat(ChatRequest::new("hello there", "sess-hist"))
        .await;
    engine
        .chat(ChatRequest::new("weather now", "sess-hist"))
        .await;

    let history = engine.sessions().history("sess-hist").await;
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].content, "hello there");
    assert_eq!(history[2].content, "weather now");
}

// --- registry ---

#[test]
fn registry_rejects_duplicates_and_unknown_default() {
    let dup: Vec<(AgentDescriptor, Arc<dyn AgentHandler>)> = vec![
        (
            descriptor("a", "a_tool", &[]),
            Arc::new(EchoHandler::new("x")),
        ),
        (
            descriptor("a", "other_tool", &[]),
            Arc::new(EchoHandler::new("y")),
        ),
    ];
    assert!(AgentRegistry::new(dup, "a").is_err());

    let ok: Vec<(AgentDescriptor, Arc<dyn AgentHandler>)> = vec![(
        descriptor("a", "a_tool", &[]),
        Arc::new(EchoHandler::new("x")),
    )];
    assert!(AgentRegistry::new(ok, "missing").is_err());
}

#[test]
fn builtin_registry_exposes_original_tool_surface() {
    let registry = builtin_registry("general").expect("builtin registry");
    let tools = registry.tool_definitions();
    assert_eq!(tools.len(), 12);

    let names = tools.iter().map(|tool| tool.name.as_str()).collect::<Vec<&str>>();
    for expected in [
        "rag_search",
        "multimodal_analysis",
        "nasa_query",
        "general_assistant",
        "weather_lookup",
        "traffic_route",
        "sql_query",
        "visualize_data",
        "cicp_process",
        "ida_design",
        "fhir_convert",
        "banking_assist",
    ] {
        assert!(names.contains(&expected), "missing tool '{expected}'");
    }

    let schema = &tools[0].parameters;
    assert!(schema["properties"]["query"].is_object());

    let (descriptor, _handler) = registry.resolve_tool("nasa_query").expect("nasa tool");
    assert_eq!(descriptor.id, "nasa");
    assert!(registry.resolve_tool("no_such_tool").is_none());

    // tool-only agents are still pinnable through the request's agent field
    for pinnable in ["cicp", "ida", "fhir", "banking"] {
        assert!(registry.contains(pinnable), "missing agent '{pinnable}'");
    }
}

#[test]
fn token_estimate_never_returns_zero() {
    assert_eq!(estimate_tokens(""), 1);
    assert_eq!(estimate_tokens("abcdefgh"), 2);
}

// --- config ---

fn test_cli(config_path: &str, profile: &str) -> Cli {
    Cli {
        profile: profile.to_string(),
        config_path: config_path.to_string(),
        session_id: None,
        default_agent: None,
        classifier: None,
        agent_timeout_secs: None,
        scorer_timeout_secs: None,
        history_max_turns: None,
        history_max_chars: None,
        telemetry_enabled: None,
        telemetry_path: None,
        log_filter: "error".to_string(),
        command: Commands::Agents {
            command: AgentCommands::List,
        },
    }
}

#[test]
fn config_defaults_apply_without_a_profile_file() {
    let cli = test_cli(".enso/missing.toml", "default");
    let profiles = load_profiles(&cli.config_path).expect("missing file is fine");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("resolve");

    assert_eq!(cfg.session_id, "default");
    assert_eq!(cfg.default_agent, "general");
    assert_eq!(cfg.classifier, ClassifierMode::Rules);
    assert_eq!(cfg.agent_timeout_secs, 45);
    assert_eq!(cfg.history_max_turns, 20);
    assert_eq!(cfg.history_max_chars, 400);
    assert!(cfg.telemetry_enabled);
}

#[test]
fn cli_flags_override_profile_values() {
    let dir = tempdir().expect("tempdir");
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        r#"
[profiles.staging]
session_id = "staging-session"
agent_timeout_secs = 9
classifier = "rules"
telemetry_enabled = false
"#,
    )
    .expect("write config");

    let mut cli = test_cli(config_path.to_str().expect("utf8 path"), "staging");
    cli.session_id = Some("cli-session".to_string());

    let profiles = load_profiles(&cli.config_path).expect("load profiles");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("resolve");

    assert_eq!(cfg.session_id, "cli-session");
    assert_eq!(cfg.agent_timeout_secs, 9);
    assert!(!cfg.telemetry_enabled);
}

#[test]
fn unknown_profile_lists_available_names() {
    let dir = tempdir().expect("tempdir");
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "[profiles.prod]\nsession_id = \"p\"\n").expect("write config");

    let cli = test_cli(config_path.to_str().expect("utf8 path"), "nope");
    let profiles = load_profiles(&cli.config_path).expect("load profiles");
    let err = resolve_runtime_config(&cli, &profiles).expect_err("unknown profile");
    assert!(err.to_string().contains("Available profiles: prod"));
}

// --- error taxonomy ---

#[test]
fn error_categories_map_message_content() {
    let handler = anyhow::anyhow!("the 'sql' backend is not configured");
    assert_eq!(categorize_error(&handler), ErrorCategory::Handler);

    let classify = anyhow::anyhow!("routing model offline during classification");
    assert_eq!(categorize_error(&classify), ErrorCategory::Classify);

    let input = anyhow::anyhow!("unknown tool 'nope'");
    assert_eq!(categorize_error(&input), ErrorCategory::Input);

    let internal = anyhow::anyhow!("something unexpected");
    assert_eq!(categorize_error(&internal), ErrorCategory::Internal);

    let formatted = format_cli_error(&internal);
    assert!(formatted.starts_with("[INTERNAL]"));
    assert!(formatted.contains("Hint:"));
}

// --- telemetry ---

#[test]
fn telemetry_sink_appends_jsonl_and_summary_counts_events() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("events.jsonl");

    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = path.to_string_lossy().into_owned();

    let sink = TelemetrySink::new(&cfg, "test".to_string());
    sink.emit(
        "chat.completed",
        json!({ "agents_called": ["weather", "nasa"], "total_tokens": 42 }),
    );
    sink.emit("dispatch.agent.failed", json!({ "agent": "broken" }));
    sink.emit("eval.completed", json!({ "overall_result": "pass" }));
    sink.emit("eval.completed", json!({ "overall_result": "fail" }));

    let content = std::fs::read_to_string(&path).expect("telemetry file exists");
    let lines = content.lines().map(str::to_string).collect::<Vec<String>>();
    assert_eq!(lines.len(), 4);

    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.parsed_events, 4);
    assert_eq!(summary.chat_completed, 1);
    assert_eq!(summary.dispatch_failed, 1);
    assert_eq!(summary.eval_pass, 1);
    assert_eq!(summary.eval_fail, 1);
    assert_eq!(summary.agent_counts.get("weather"), Some(&1));
    assert_eq!(summary.unique_runs.len(), 1);
}

#[test]
fn telemetry_disabled_sink_writes_nothing() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("events.jsonl");

    let mut cfg = base_cfg();
    cfg.telemetry_enabled = false;
    cfg.telemetry_path = path.to_string_lossy().into_owned();

    let sink = TelemetrySink::new(&cfg, "test".to_string());
    sink.emit("chat.completed", json!({}));
    assert!(!path.exists());
}

#[test]
fn telemetry_summary_skips_unparseable_lines() {
    let lines = vec![
        "not json".to_string(),
        json!({ "event": "chat.completed", "run_id": "r1" }).to_string(),
    ];
    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.parsed_events, 1);
    assert_eq!(summary.chat_completed, 1);
}

// --- server handlers ---

fn test_server_state() -> Arc<ServerState> {
    let cfg = base_cfg();
    Arc::new(ServerState {
        telemetry: test_telemetry(&cfg),
        engine: test_engine(scripted_registry(), heuristic_scorers()),
        cfg,
    })
}

#[tokio::test]
async fn server_rejects_empty_chat_message() {
    let state = test_server_state();
    let result = handle_chat(State(state), Json(ChatRequest::new("   ", "s"))).await;
    let (status, _) = result.err().expect("empty message must be rejected");
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn server_chat_returns_full_response_shape() {
    let state = test_server_state();
    let Json(response) = handle_chat(
        State(state),
        Json(ChatRequest::new("weather please", "http-session")),
    )
    .await
    .expect("chat succeeds");

    assert_eq!(response.session_id, "http-session");
    assert_eq!(response.agents_called, vec!["weather".to_string()]);
    assert!(!response.metadata.evaluation_scores.scores.is_empty());
}

#[tokio::test]
async fn server_tool_call_validates_tool_name_and_arguments() {
    let state = test_server_state();

    let unknown = handle_tools_call(
        State(state.clone()),
        Json(ToolCallRequest {
            tool_name: "no_such_tool".to_string(),
            arguments: json!({ "query": "hi" }),
        }),
    )
    .await;
    let (status, _) = unknown.err().expect("unknown tool is rejected");
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let Json(called) = handle_tools_call(
        State(state.clone()),
        Json(ToolCallRequest {
            tool_name: "weather_lookup".to_string(),
            arguments: json!({ "query": "Berlin" }),
        }),
    )
    .await
    .expect("known tool succeeds");
    assert_eq!(called.result, "Sunny in Berlin, 21 degrees.");

    let failing = handle_tools_call(
        State(state),
        Json(ToolCallRequest {
            tool_name: "broken_tool".to_string(),
            arguments: json!({ "query": "hi" }),
        }),
    )
    .await;
    let (status, _) = failing.err().expect("failing handler surfaces 500");
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn server_health_and_tools_list_describe_the_registry() {
    let state = test_server_state();

    let Json(health) = handle_health(State(state.clone())).await;
    assert_eq!(health.status, "ok");
    assert!(health.agents.contains(&"general".to_string()));

    let Json(listed) = handle_tools_list(State(state)).await;
    assert_eq!(listed.tools.len(), 6);
}
