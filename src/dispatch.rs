use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::evaluate::round_metric;
use crate::registry::{AgentInvocation, AgentRegistry};

// GPT-4.1 pricing per 1K tokens.
pub const COST_PER_1K_INPUT: f64 = 0.002;
pub const COST_PER_1K_OUTPUT: f64 = 0.008;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn estimated_cost(&self) -> f64 {
        let cost = (self.input_tokens as f64 / 1000.0) * COST_PER_1K_INPUT
            + (self.output_tokens as f64 / 1000.0) * COST_PER_1K_OUTPUT;
        (cost * 1_000_000.0).round() / 1_000_000.0
    }

    pub fn accumulate(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Outcome of one agent invocation. Request-scoped; one per selected
/// agent regardless of success or failure.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub agent_id: String,
    pub outcome: Result<String, String>,
    pub usage: TokenUsage,
    pub latency_ms: f64,
}

impl DispatchResult {
    pub fn succeeded(agent_id: String, text: String, usage: TokenUsage, latency_ms: f64) -> Self {
        Self {
            agent_id,
            outcome: Ok(text),
            usage,
            latency_ms,
        }
    }

    pub fn failed(agent_id: String, note: String, latency_ms: f64) -> Self {
        Self {
            agent_id,
            outcome: Err(note),
            usage: TokenUsage::default(),
            latency_ms,
        }
    }

    pub fn is_err(&self) -> bool {
        self.outcome.is_err()
    }

    /// Text that flows into the combined answer: the handler's output,
    /// or an inline notice for a failed agent.
    pub fn text(&self) -> String {
        match &self.outcome {
            Ok(text) => text.clone(),
            Err(note) => format!("⚠ {} agent error: {}", self.agent_id, note),
        }
    }
}

/// Fans out to the selected agents concurrently and fans results back in
/// by selection position, never completion order. Each invocation runs
/// on its own task so a panicking, failing, or slow handler cannot
/// cancel, delay, or corrupt the others.
pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    agent_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<AgentRegistry>, agent_timeout: Duration) -> Self {
        Self {
            registry,
            agent_timeout,
        }
    }

    pub async fn dispatch(
        &self,
        agent_ids: &[String],
        query: &str,
        file_path: Option<&str>,
        history_summary: &str,
    ) -> Vec<DispatchResult> {
        let mut handles = Vec::with_capacity(agent_ids.len());
        for agent_id in agent_ids {
            let registry = self.registry.clone();
            let agent_id = agent_id.clone();
            let timeout = self.agent_timeout;
            let invocation = AgentInvocation {
                query: query.to_string(),
                file_path: file_path.map(str::to_string),
                history: history_summary.to_string(),
                extra: serde_json::Map::new(),
            };
            handles.push((
                agent_id.clone(),
                tokio::spawn(async move {
                    invoke_agent(registry, agent_id, invocation, timeout).await
                }),
            ));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (agent_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    tracing::error!(agent = %agent_id, error = %join_err, "agent task aborted");
                    DispatchResult::failed(agent_id, format!("handler task aborted: {join_err}"), 0.0)
                }
            };
            results.push(result);
        }
        results
    }
}

async fn invoke_agent(
    registry: Arc<AgentRegistry>,
    agent_id: String,
    invocation: AgentInvocation,
    timeout: Duration,
) -> DispatchResult {
    let started = Instant::now();
    let elapsed_ms = |started: Instant| round_metric(started.elapsed().as_secs_f64() * 1000.0);

    let Some(handler) = registry.handler(&agent_id) else {
        // Unreachable when selection is registry-constrained; kept so a
        // misbehaving caller degrades instead of panicking.
        return DispatchResult::failed(agent_id, "unknown agent id".to_string(), 0.0);
    };

    match tokio::time::timeout(timeout, handler.invoke(&invocation)).await {
        Ok(Ok(reply)) => {
            DispatchResult::succeeded(agent_id, reply.text, reply.usage, elapsed_ms(started))
        }
        Ok(Err(err)) => {
            tracing::warn!(agent = %agent_id, error = %err, "agent handler failed");
            DispatchResult::failed(agent_id, format!("{err:#}"), elapsed_ms(started))
        }
        Err(_) => {
            tracing::warn!(agent = %agent_id, timeout_secs = timeout.as_secs(), "agent handler timed out");
            DispatchResult::failed(
                agent_id,
                format!("timed out after {}s", timeout.as_secs()),
                elapsed_ms(started),
            )
        }
    }
}
