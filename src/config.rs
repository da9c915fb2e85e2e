//! Automaton Configuration
//!
//! Loads and saves the daemon's configuration from `~/.automaton/automaton.json`.
//! The installer writes this file; the runtime treats it as a single immutable
//! record with every knob's default explicit.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::HundredthCents;

/// Directory name under the user's home for all automaton data.
pub const AUTOMATON_DIR_NAME: &str = ".automaton";

/// Config file name within the automaton directory.
const CONFIG_FILENAME: &str = "automaton.json";

/// Out-of-band creator input; consumed and deleted on read.
pub const CREATOR_MESSAGE_FILENAME: &str = "CREATOR_MESSAGE.md";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomatonConfig {
    pub name: String,
    pub genesis_prompt: String,
    pub creator_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_address: Option<String>,
    pub sandbox_id: String,
    pub api_url: String,
    pub api_key: String,
    pub inference_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub social_relay_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_rpc_url: Option<String>,
    pub wallet_address: String,

    pub heartbeat_config_path: String,
    pub db_path: String,
    pub skills_dir: String,
    pub log_level: LogLevel,
    pub version: String,
    pub max_children: u32,

    // Budget knobs. All currency in hundredth-cents.
    pub per_call_ceiling_hundredth_cents: HundredthCents,
    pub hourly_budget_hundredth_cents: HundredthCents,
    pub enable_model_fallback: bool,
    /// Minimum seconds between self-initiated turns.
    pub min_turn_interval_secs: u64,
    /// Recent turns loaded into the context window.
    pub context_turns: u32,
    /// Turn count past which older history is folded into a summary.
    pub summary_threshold: u32,
    pub max_tokens_per_turn: u32,
}

/// Default configuration. Fields with no sensible default are left empty
/// so the installer can fill them in.
pub fn default_config() -> AutomatonConfig {
    AutomatonConfig {
        name: String::new(),
        genesis_prompt: String::new(),
        creator_address: String::new(),
        creator_message: None,
        parent_address: None,
        sandbox_id: String::new(),
        api_url: "https://api.conway.tech".to_string(),
        api_key: String::new(),
        inference_url: "https://inference.conway.tech".to_string(),
        social_relay_url: Some("https://social.conway.tech".to_string()),
        chain_rpc_url: Some("https://mainnet.base.org".to_string()),
        wallet_address: String::new(),
        heartbeat_config_path: "~/.automaton/heartbeat.yml".to_string(),
        db_path: "~/.automaton/state.db".to_string(),
        skills_dir: "~/.automaton/skills".to_string(),
        log_level: LogLevel::Info,
        version: env!("CARGO_PKG_VERSION").to_string(),
        max_children: 3,
        per_call_ceiling_hundredth_cents: 2_000,
        hourly_budget_hundredth_cents: 50_000,
        enable_model_fallback: true,
        min_turn_interval_secs: 300,
        context_turns: 20,
        summary_threshold: 15,
        max_tokens_per_turn: 4096,
    }
}

/// Returns the automaton base directory: `~/.automaton`.
pub fn get_automaton_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    home.join(AUTOMATON_DIR_NAME)
}

/// Returns the full path to the config file: `~/.automaton/automaton.json`.
pub fn get_config_path() -> PathBuf {
    get_automaton_dir().join(CONFIG_FILENAME)
}

/// Returns the path of the pending creator message file, if one exists.
pub fn creator_message_path() -> PathBuf {
    get_automaton_dir().join(CREATOR_MESSAGE_FILENAME)
}

/// Load the config from disk, merging missing fields with defaults.
///
/// Returns `None` if the config file does not exist or cannot be parsed.
pub fn load_config() -> Option<AutomatonConfig> {
    let config_path = get_config_path();
    if !config_path.exists() {
        return None;
    }

    let contents = fs::read_to_string(&config_path).ok()?;
    let mut config: AutomatonConfig = serde_json::from_str(&contents).ok()?;

    let defaults = default_config();

    if config.api_url.is_empty() {
        config.api_url = defaults.api_url;
    }
    if config.inference_url.is_empty() {
        config.inference_url = defaults.inference_url;
    }
    if config.heartbeat_config_path.is_empty() {
        config.heartbeat_config_path = defaults.heartbeat_config_path;
    }
    if config.db_path.is_empty() {
        config.db_path = defaults.db_path;
    }
    if config.skills_dir.is_empty() {
        config.skills_dir = defaults.skills_dir;
    }
    if config.version.is_empty() {
        config.version = defaults.version;
    }
    if config.max_children == 0 {
        config.max_children = defaults.max_children;
    }
    if config.per_call_ceiling_hundredth_cents == 0 {
        config.per_call_ceiling_hundredth_cents = defaults.per_call_ceiling_hundredth_cents;
    }
    if config.hourly_budget_hundredth_cents == 0 {
        config.hourly_budget_hundredth_cents = defaults.hourly_budget_hundredth_cents;
    }
    if config.min_turn_interval_secs == 0 {
        config.min_turn_interval_secs = defaults.min_turn_interval_secs;
    }
    if config.context_turns == 0 {
        config.context_turns = defaults.context_turns;
    }
    if config.summary_threshold == 0 {
        config.summary_threshold = defaults.summary_threshold;
    }
    if config.max_tokens_per_turn == 0 {
        config.max_tokens_per_turn = defaults.max_tokens_per_turn;
    }

    Some(config)
}

/// Save the config to disk at `~/.automaton/automaton.json`.
///
/// Creates the automaton directory with mode 0o700 if it does not exist.
/// The config file is written with mode 0o600 since it contains the API key.
pub fn save_config(config: &AutomatonConfig) -> Result<()> {
    let dir = get_automaton_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create automaton directory")?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    let config_path = get_config_path();
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(&config_path, &json).context("Failed to write config file")?;
    fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

/// Resolve a path that may start with `~` to an absolute path.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}

/// Read and delete the pending creator message, if present.
///
/// The file is removed before the content is returned so a crash mid-turn
/// cannot replay the same message.
pub fn take_creator_message() -> Option<String> {
    let path = creator_message_path();
    if !path.exists() {
        return None;
    }
    let content = fs::read_to_string(&path).ok()?;
    let _ = fs::remove_file(&path);
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path_with_tilde() {
        let resolved = resolve_path("~/some/path");
        assert!(!resolved.starts_with('~'));
        assert!(resolved.ends_with("some/path"));
    }

    #[test]
    fn test_resolve_path_without_tilde() {
        let path = "/absolute/path/to/file";
        assert_eq!(resolve_path(path), path);
    }

    #[test]
    fn test_default_budget_knobs() {
        let config = default_config();
        assert_eq!(config.per_call_ceiling_hundredth_cents, 2_000);
        assert_eq!(config.hourly_budget_hundredth_cents, 50_000);
        assert!(config.enable_model_fallback);
        assert_eq!(config.context_turns, 20);
        assert_eq!(config.summary_threshold, 15);
        assert_eq!(config.max_children, 3);
    }

    #[test]
    fn test_config_round_trip_json() {
        let config = default_config();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AutomatonConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.hourly_budget_hundredth_cents, config.hourly_budget_hundredth_cents);
        assert_eq!(parsed.log_level, LogLevel::Info);
    }
}
