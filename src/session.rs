use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One exchange unit in a session. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub agents: Vec<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            agents: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, agents: Vec<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            agents,
        }
    }
}

/// In-memory conversation store. Sessions are created lazily on first
/// append; reading an unseen session id yields empty history rather than
/// an error. Appends to the same session serialize on a per-key lock;
/// distinct sessions never contend.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Vec<Turn>>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn session(&self, session_id: &str) -> Arc<Mutex<Vec<Turn>>> {
        if let Some(turns) = self.sessions.read().await.get(session_id).cloned() {
            return turns;
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    pub async fn history(&self, session_id: &str) -> Vec<Turn> {
        match self.sessions.read().await.get(session_id) {
            Some(turns) => turns.lock().await.clone(),
            None => Vec::new(),
        }
    }

    pub async fn turn_count(&self, session_id: &str) -> usize {
        match self.sessions.read().await.get(session_id) {
            Some(turns) => turns.lock().await.len(),
            None => 0,
        }
    }

    pub async fn append_turn(&self, session_id: &str, turn: Turn) {
        let session = self.session(session_id).await;
        session.lock().await.push(turn);
    }

    /// Appends a user/assistant pair under one lock hold so concurrent
    /// requests to the same session interleave at exchange granularity.
    pub async fn append_exchange(&self, session_id: &str, user: Turn, assistant: Turn) {
        let session = self.session(session_id).await;
        let mut turns = session.lock().await;
        turns.push(user);
        turns.push(assistant);
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids = self
            .sessions
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<String>>();
        ids.sort();
        ids
    }
}

/// Renders the most recent turns as a compact text block for agent
/// prompts. Long messages are truncated so the summary stays within
/// context limits even though the store keeps turns unbounded.
pub fn summarize_history(turns: &[Turn], max_messages: usize, max_chars: usize) -> String {
    let recent = &turns[turns.len().saturating_sub(max_messages.max(1))..];
    let mut lines = Vec::with_capacity(recent.len());

    for turn in recent {
        let mut content = turn.content.clone();
        if content.chars().count() > max_chars {
            content = content.chars().take(max_chars).collect();
            content.push('…');
        }
        lines.push(format!("{}: {}", turn.role.label(), content));
    }

    lines.join("\n")
}
