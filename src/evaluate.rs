use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const METRIC_NAMES: [&str; 4] = ["relevance", "coherence", "fluency", "groundedness"];
pub const PASS_THRESHOLD: f64 = 3.0;
pub const SCORE_MIN: f64 = 1.0;
pub const SCORE_MAX: f64 = 5.0;

pub fn round_metric(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub fn round_score(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricScore {
    pub metric: String,
    pub score: Option<f64>,
    pub result: String,
    pub reason: String,
}

impl MetricScore {
    pub fn scored(metric: &str, score: f64, reason: String) -> Self {
        let score = round_score(score.clamp(SCORE_MIN, SCORE_MAX));
        let result = if score >= PASS_THRESHOLD {
            "pass"
        } else {
            "fail"
        };
        Self {
            metric: metric.to_string(),
            score: Some(score),
            result: result.to_string(),
            reason,
        }
    }

    pub fn errored(metric: &str, reason: String) -> Self {
        Self {
            metric: metric.to_string(),
            score: None,
            result: "error".to_string(),
            reason,
        }
    }
}

/// Structured output of the quality-evaluation stage. Attached to
/// response metadata only; never persisted in the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreCard {
    pub scores: Vec<MetricScore>,
    pub overall_score: Option<f64>,
    pub overall_result: String,
}

impl ScoreCard {
    /// Overall = mean of the numeric scores present; errored metrics
    /// are excluded. All-error cards have no overall score and fail.
    pub fn from_scores(scores: Vec<MetricScore>) -> Self {
        let numeric = scores
            .iter()
            .filter_map(|score| score.score)
            .collect::<Vec<f64>>();

        let overall_score = if numeric.is_empty() {
            None
        } else {
            Some(round_score(
                numeric.iter().sum::<f64>() / numeric.len() as f64,
            ))
        };

        let overall_result = match overall_score {
            Some(overall) if overall >= PASS_THRESHOLD => "pass".to_string(),
            _ => "fail".to_string(),
        };

        Self {
            scores,
            overall_score,
            overall_result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricJudgment {
    pub score: f64,
    pub reason: String,
}

/// One opaque quality judgment. Implementations may call external
/// judges; the built-in heuristic judge is deterministic and offline.
#[async_trait]
pub trait MetricScorer: Send + Sync {
    fn metric(&self) -> &str;
    async fn score(&self, query: &str, answer: &str) -> Result<MetricJudgment>;
}

/// Runs the metric scorers concurrently against a query/answer pair.
/// Scorer errors and timeouts mark that metric as "error" instead of
/// failing the request; this stage runs after the turn is persisted, so
/// it can never lose conversational state.
pub struct Evaluator {
    scorers: Vec<Arc<dyn MetricScorer>>,
    scorer_timeout: Duration,
}

impl Evaluator {
    pub fn new(scorers: Vec<Arc<dyn MetricScorer>>, scorer_timeout: Duration) -> Self {
        Self {
            scorers,
            scorer_timeout,
        }
    }

    pub async fn evaluate(&self, query: &str, answer: &str) -> ScoreCard {
        let mut handles = Vec::with_capacity(self.scorers.len());
        for scorer in &self.scorers {
            let scorer = scorer.clone();
            let metric = scorer.metric().to_string();
            let query = query.to_string();
            let answer = answer.to_string();
            let timeout = self.scorer_timeout;
            handles.push((
                metric,
                tokio::spawn(async move {
                    tokio::time::timeout(timeout, scorer.score(&query, &answer)).await
                }),
            ));
        }

        let mut scores = Vec::with_capacity(handles.len());
        for (metric, handle) in handles {
            let score = match handle.await {
                Ok(Ok(Ok(judgment))) => MetricScore::scored(&metric, judgment.score, judgment.reason),
                Ok(Ok(Err(err))) => {
                    tracing::warn!(metric = %metric, error = %err, "metric scorer failed");
                    MetricScore::errored(&metric, format!("{err:#}"))
                }
                Ok(Err(_elapsed)) => {
                    tracing::warn!(metric = %metric, "metric scorer timed out");
                    MetricScore::errored(
                        &metric,
                        format!("timed out after {}s", self.scorer_timeout.as_secs()),
                    )
                }
                Err(join_err) => {
                    tracing::error!(metric = %metric, error = %join_err, "metric scorer task aborted");
                    MetricScore::errored(&metric, format!("scorer task aborted: {join_err}"))
                }
            };
            scores.push(score);
        }

        ScoreCard::from_scores(scores)
    }
}

pub fn content_terms(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .filter(|token| token.len() > 2)
        .collect::<Vec<String>>()
}

/// Deterministic lexical judge shipped with the binary so the
/// evaluation stage works without external credentials.
pub struct HeuristicScorer {
    metric: &'static str,
}

impl HeuristicScorer {
    pub fn new(metric: &'static str) -> Self {
        Self { metric }
    }
}

pub fn heuristic_scorers() -> Vec<Arc<dyn MetricScorer>> {
    METRIC_NAMES
        .iter()
        .map(|metric| Arc::new(HeuristicScorer::new(metric)) as Arc<dyn MetricScorer>)
        .collect()
}

#[async_trait]
impl MetricScorer for HeuristicScorer {
    fn metric(&self) -> &str {
        self.metric
    }

    async fn score(&self, query: &str, answer: &str) -> Result<MetricJudgment> {
        let judgment = match self.metric {
            "relevance" => judge_relevance(query, answer),
            "coherence" => judge_coherence(answer),
            "fluency" => judge_fluency(answer),
            "groundedness" => judge_groundedness(query, answer),
            other => return Err(anyhow::anyhow!("unknown metric '{}'", other)),
        };
        Ok(judgment)
    }
}

fn judge_relevance(query: &str, answer: &str) -> MetricJudgment {
    let terms = content_terms(query);
    if terms.is_empty() {
        return MetricJudgment {
            score: 3.0,
            reason: "query has no scorable terms".to_string(),
        };
    }

    let body = answer.to_ascii_lowercase();
    let matched = terms
        .iter()
        .filter(|term| body.contains(term.as_str()))
        .count();
    let fraction = matched as f64 / terms.len() as f64;
    MetricJudgment {
        score: 1.0 + 4.0 * fraction,
        reason: format!("{matched} of {} query terms appear in the answer", terms.len()),
    }
}

fn judge_coherence(answer: &str) -> MetricJudgment {
    let sentences = answer
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count();
    let structured = answer.contains("###") || answer.contains("\n-") || answer.contains("**");

    let mut score = 3.0;
    if sentences >= 2 {
        score += 1.0;
    }
    if structured {
        score += 1.0;
    }
    if answer.trim().chars().count() < 40 {
        score -= 1.0;
    }

    MetricJudgment {
        score,
        reason: format!("{sentences} sentence(s), structured markup: {structured}"),
    }
}

fn judge_fluency(answer: &str) -> MetricJudgment {
    let words = answer.split_whitespace().count();
    if words == 0 {
        return MetricJudgment {
            score: 1.0,
            reason: "empty answer".to_string(),
        };
    }

    let avg_len = answer
        .split_whitespace()
        .map(|w| w.chars().count())
        .sum::<usize>() as f64
        / words as f64;

    let score = if (3.0..=9.0).contains(&avg_len) { 4.5 } else { 3.0 };
    MetricJudgment {
        score,
        reason: format!("{words} words, mean word length {avg_len:.1}"),
    }
}

fn judge_groundedness(query: &str, answer: &str) -> MetricJudgment {
    if answer.contains("agent error") {
        return MetricJudgment {
            score: 2.0,
            reason: "answer contains an agent error notice".to_string(),
        };
    }

    let terms = content_terms(query);
    let grounded_sentences = answer
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .filter(|sentence| {
            let lower = sentence.to_ascii_lowercase();
            terms.iter().any(|term| lower.contains(term.as_str()))
        })
        .count();

    let score = if grounded_sentences > 0 { 4.0 } else { 3.0 };
    MetricJudgment {
        score,
        reason: format!("{grounded_sentences} sentence(s) reference the question"),
    }
}
