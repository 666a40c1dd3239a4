use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::{Cli, ClassifierMode};
use crate::registry::DEFAULT_AGENT_ID;

/// Fully resolved runtime settings: CLI flags win over the active TOML
/// profile, which wins over built-in defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub session_id: String,
    pub default_agent: String,
    pub classifier: ClassifierMode,
    pub agent_timeout_secs: u64,
    pub scorer_timeout_secs: u64,
    pub history_max_turns: usize,
    pub history_max_chars: usize,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub session_id: Option<String>,
    pub default_agent: Option<String>,
    pub classifier: Option<ClassifierMode>,
    pub agent_timeout_secs: Option<u64>,
    pub scorer_timeout_secs: Option<u64>,
    pub history_max_turns: Option<usize>,
    pub history_max_chars: Option<usize>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check classifier/timeout values and field names.",
            path.display()
        )
    })
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        session_id: cli
            .session_id
            .clone()
            .or(profile.session_id)
            .unwrap_or_else(|| "default".to_string()),
        default_agent: cli
            .default_agent
            .clone()
            .or(profile.default_agent)
            .unwrap_or_else(|| DEFAULT_AGENT_ID.to_string()),
        classifier: cli
            .classifier
            .or(profile.classifier)
            .unwrap_or(ClassifierMode::Rules),
        agent_timeout_secs: cli
            .agent_timeout_secs
            .or(profile.agent_timeout_secs)
            .unwrap_or(45)
            .max(1),
        scorer_timeout_secs: cli
            .scorer_timeout_secs
            .or(profile.scorer_timeout_secs)
            .unwrap_or(20)
            .max(1),
        history_max_turns: cli
            .history_max_turns
            .or(profile.history_max_turns)
            .unwrap_or(20)
            .max(1),
        history_max_chars: cli
            .history_max_chars
            .or(profile.history_max_chars)
            .unwrap_or(400)
            .max(16),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".enso/telemetry/events.jsonl".to_string()),
    })
}
