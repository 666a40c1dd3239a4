use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::classifier::Classifier;
use crate::combine::combine;
use crate::dispatch::{Dispatcher, TokenUsage};
use crate::evaluate::{Evaluator, ScoreCard, round_metric};
use crate::registry::AgentRegistry;
use crate::session::{SessionStore, Turn, summarize_history};
use crate::telemetry::TelemetrySink;

pub const DEFAULT_SESSION_ID: &str = "default";

fn default_session_id() -> String {
    DEFAULT_SESSION_ID.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Pins the request to one registered agent, bypassing classification.
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub file_path: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            agent: None,
            session_id: session_id.into(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenUsageReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

impl From<TokenUsage> for TokenUsageReport {
    fn from(usage: TokenUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens(),
            estimated_cost: usage.estimated_cost(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub token_usage: TokenUsageReport,
    pub evaluation_scores: ScoreCard,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub reply: String,
    pub agent: String,
    pub agents_called: Vec<String>,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: ResponseMetadata,
}

/// The full request pipeline: load history, classify, dispatch the
/// selected agents concurrently, combine, persist the exchange, then
/// score the answer. Every stage degrades instead of failing, so `chat`
/// always produces a response.
pub struct OrchestrationEngine {
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionStore>,
    classifier: Classifier,
    dispatcher: Dispatcher,
    evaluator: Evaluator,
    telemetry: TelemetrySink,
    history_max_turns: usize,
    history_max_chars: usize,
}

impl OrchestrationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionStore>,
        classifier: Classifier,
        dispatcher: Dispatcher,
        evaluator: Evaluator,
        telemetry: TelemetrySink,
        history_max_turns: usize,
        history_max_chars: usize,
    ) -> Self {
        Self {
            registry,
            sessions,
            classifier,
            dispatcher,
            evaluator,
            telemetry,
            history_max_turns: history_max_turns.max(1),
            history_max_chars: history_max_chars.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub async fn chat(&self, request: ChatRequest) -> ChatResponse {
        let started = Instant::now();
        let query = request.message.trim().to_string();
        let session_id = if request.session_id.trim().is_empty() {
            DEFAULT_SESSION_ID.to_string()
        } else {
            request.session_id.trim().to_string()
        };
        let file_path = request
            .file_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty());

        let history = self.sessions.history(&session_id).await;
        let history_summary =
            summarize_history(&history, self.history_max_turns, self.history_max_chars);

        let selected = self
            .select_agents(&request, &query, &history_summary, file_path)
            .await;
        tracing::info!(
            session_id = %session_id,
            agents = ?selected,
            "agents selected"
        );

        let results = self
            .dispatcher
            .dispatch(&selected, &query, file_path, &history_summary)
            .await;
        for result in results.iter().filter(|result| result.is_err()) {
            self.telemetry.emit(
                "dispatch.agent.failed",
                json!({
                    "session_id": session_id,
                    "agent": result.agent_id,
                    "latency_ms": result.latency_ms,
                    "note": result.outcome.as_ref().err()
                }),
            );
        }

        let combined = combine(&results);

        self.sessions
            .append_exchange(
                &session_id,
                Turn::user(query.clone()),
                Turn::assistant(combined.text.clone(), combined.agents.clone()),
            )
            .await;

        // Evaluation runs strictly after persistence; its failures can
        // only degrade the scorecard, never the stored exchange.
        let evaluation_scores = self.evaluator.evaluate(&query, &combined.text).await;
        self.telemetry.emit(
            "eval.completed",
            json!({
                "session_id": session_id,
                "overall_score": evaluation_scores.overall_score,
                "overall_result": evaluation_scores.overall_result
            }),
        );

        let agent = combined
            .agents
            .first()
            .cloned()
            .unwrap_or_else(|| self.registry.default_id().to_string());

        self.telemetry.emit(
            "chat.completed",
            json!({
                "session_id": session_id,
                "agents_called": combined.agents,
                "failed_agents": results.iter().filter(|result| result.is_err()).count(),
                "total_tokens": combined.usage.total_tokens(),
                "estimated_cost": combined.usage.estimated_cost(),
                "latency_ms": round_metric(started.elapsed().as_secs_f64() * 1000.0)
            }),
        );

        ChatResponse {
            reply: combined.text,
            agent,
            agents_called: combined.agents,
            session_id,
            timestamp: Utc::now(),
            metadata: ResponseMetadata {
                token_usage: combined.usage.into(),
                evaluation_scores,
            },
        }
    }

    async fn select_agents(
        &self,
        request: &ChatRequest,
        query: &str,
        history_summary: &str,
        file_path: Option<&str>,
    ) -> Vec<String> {
        if let Some(pinned) = request.agent.as_deref().map(str::trim)
            && !pinned.is_empty()
        {
            if self.registry.contains(pinned) {
                return vec![pinned.to_string()];
            }
            tracing::warn!(agent = %pinned, "pinned agent is not registered; classifying instead");
        }

        self.classifier
            .classify(&self.registry, query, history_summary, file_path)
            .await
    }
}
