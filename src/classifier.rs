use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::registry::AgentRegistry;

const IMAGE_EXTS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "webp", "bmp"];
const DOC_EXTS: [&str; 7] = ["txt", "md", "pdf", "csv", "json", "docx", "xlsx"];

const RAG_HINTS: [&str; 12] = [
    "document",
    "uploaded",
    "search the file",
    "find in file",
    "my file",
    "the file",
    "the pdf",
    "the csv",
    "retrieve",
    "search index",
    "internal search",
    "knowledge base",
];

/// External reasoning capability used by the model-assisted strategy.
/// The raw completion is never trusted; it is parsed and validated
/// against the registry before use.
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Deterministic keyword and file-extension routing, evaluated in
/// registry order. Mirrors the behaviour users see with no model wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedClassifier;

impl RuleBasedClassifier {
    pub fn classify(
        &self,
        registry: &AgentRegistry,
        query: &str,
        file_path: Option<&str>,
    ) -> Vec<String> {
        let q = query.trim().to_lowercase();

        // Explicit rag prefix always routes to rag alone.
        if (q.starts_with("rag ") || q.starts_with("rag:")) && registry.contains("rag") {
            return vec!["rag".to_string()];
        }

        let mut selected = Vec::new();

        if let Some(path) = file_path {
            match file_extension(path) {
                Some(ext) if IMAGE_EXTS.contains(&ext.as_str()) => {
                    selected.push("multimodal".to_string());
                }
                Some(ext) if DOC_EXTS.contains(&ext.as_str()) => {
                    selected.push("rag".to_string());
                }
                _ => {}
            }
        }

        for descriptor in registry.descriptors() {
            if descriptor
                .trigger_terms
                .iter()
                .any(|term| q.contains(term.as_str()))
            {
                selected.push(descriptor.id.clone());
            }
        }

        if file_path.is_none() && RAG_HINTS.iter().any(|hint| q.contains(hint)) {
            selected.push("rag".to_string());
        }

        finalize_selection(registry, selected)
    }
}

/// Delegates routing to an external reasoning capability. Unknown or
/// malformed identifiers in the raw output are dropped; a model failure
/// degrades to the rule-based result.
pub struct ModelAssistedClassifier {
    model: Arc<dyn ReasoningModel>,
    rules: RuleBasedClassifier,
}

impl ModelAssistedClassifier {
    pub fn new(model: Arc<dyn ReasoningModel>) -> Self {
        Self {
            model,
            rules: RuleBasedClassifier,
        }
    }

    pub async fn classify(
        &self,
        registry: &AgentRegistry,
        query: &str,
        history_summary: &str,
        file_path: Option<&str>,
    ) -> Vec<String> {
        let prompt = build_routing_prompt(registry, query, history_summary, file_path);
        let raw = match self.model.complete(&prompt).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "routing model failed; falling back to rules");
                return self.rules.classify(registry, query, file_path);
            }
        };

        let candidates = parse_agent_ids(&raw);
        let valid = candidates
            .into_iter()
            .filter(|id| registry.contains(id))
            .collect::<Vec<String>>();

        finalize_selection(registry, valid)
    }
}

/// Interchangeable selection strategies. Both guarantee a non-empty,
/// deduplicated result drawn from the registry's known set.
pub enum Classifier {
    Rules(RuleBasedClassifier),
    Model(ModelAssistedClassifier),
}

impl Classifier {
    pub fn rules() -> Self {
        Classifier::Rules(RuleBasedClassifier)
    }

    pub fn model(model: Arc<dyn ReasoningModel>) -> Self {
        Classifier::Model(ModelAssistedClassifier::new(model))
    }

    pub async fn classify(
        &self,
        registry: &AgentRegistry,
        query: &str,
        history_summary: &str,
        file_path: Option<&str>,
    ) -> Vec<String> {
        match self {
            Classifier::Rules(rules) => rules.classify(registry, query, file_path),
            Classifier::Model(model) => {
                model
                    .classify(registry, query, history_summary, file_path)
                    .await
            }
        }
    }
}

fn finalize_selection(registry: &AgentRegistry, selected: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for id in selected {
        if seen.insert(id.clone()) {
            out.push(id);
        }
    }

    if out.is_empty() {
        out.push(registry.default_id().to_string());
    }
    out
}

fn file_extension(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
}

pub fn build_routing_prompt(
    registry: &AgentRegistry,
    query: &str,
    history_summary: &str,
    file_path: Option<&str>,
) -> String {
    let mut prompt = String::from(
        "Select which agents should answer the user's request. Reply with a \
         comma-separated list of agent ids, nothing else.\n\nAgents:\n",
    );
    for descriptor in registry.descriptors() {
        prompt.push_str(&format!("- {}: {}\n", descriptor.id, descriptor.description));
    }
    if let Some(path) = file_path {
        prompt.push_str(&format!("\nAttached file: {path}\n"));
    }
    if !history_summary.is_empty() {
        prompt.push_str(&format!("\nConversation so far:\n{history_summary}\n"));
    }
    prompt.push_str(&format!("\nUser request:\n{query}\n"));
    prompt
}

/// Extracts candidate agent ids from untrusted model output. Accepts
/// comma/newline separated lists and JSON-array-ish text.
pub fn parse_agent_ids(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == '\n' || c.is_whitespace())
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
        .collect::<Vec<String>>()
}
