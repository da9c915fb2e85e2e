//! Heartbeat Configuration
//!
//! YAML-based configuration for heartbeat entries. Provides default
//! entries for the standard maintenance tasks and supports loading/saving
//! from disk with sync to the SQLite store.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use yaml_rust2::{Yaml, YamlLoader};

use crate::state::Database;
use crate::types::{HeartbeatConfig, HeartbeatEntry};

/// Default heartbeat configuration with the five standard entries.
///
/// - `heartbeat_ping` - liveness record (runs even when dead)
/// - `check_credits` - refresh the liquid balance (allowed at critical)
/// - `check_usdc_balance` - refresh on-chain funds (allowed at critical)
/// - `check_social_inbox` - poll for incoming messages
/// - `health_check` - sandbox connectivity and disk space
pub const DEFAULT_HEARTBEAT_CONFIG: &str = r#"entries:
  - name: heartbeat_ping
    schedule: "*/5 * * * *"
    task: heartbeat_ping
    enabled: true
    criticalAllowed: true
  - name: check_credits
    schedule: "*/15 * * * *"
    task: check_credits
    enabled: true
    criticalAllowed: true
  - name: check_usdc_balance
    schedule: "*/30 * * * *"
    task: check_usdc_balance
    enabled: true
    criticalAllowed: true
  - name: check_social_inbox
    schedule: "*/10 * * * *"
    task: check_social_inbox
    enabled: true
    criticalAllowed: false
  - name: health_check
    schedule: "0 * * * *"
    task: health_check
    enabled: true
    criticalAllowed: false
defaultIntervalMs: 300000
lowComputeMultiplier: 4.0
"#;

/// Parse a YAML document into a `HeartbeatConfig`.
fn parse_yaml_config(docs: &[Yaml]) -> Result<HeartbeatConfig> {
    let doc = docs.first().context("Empty YAML document")?;

    let entries_yaml = doc["entries"]
        .as_vec()
        .context("Missing or invalid 'entries' key in heartbeat config")?;

    let default_interval_ms = doc["defaultIntervalMs"].as_i64().unwrap_or(300_000) as u64;

    let low_compute_multiplier = doc["lowComputeMultiplier"]
        .as_f64()
        .or_else(|| doc["lowComputeMultiplier"].as_i64().map(|v| v as f64))
        .unwrap_or(4.0);

    let mut entries = Vec::with_capacity(entries_yaml.len());

    for item in entries_yaml {
        let name = item["name"]
            .as_str()
            .context("Missing 'name' in heartbeat entry")?
            .to_string();

        let schedule = item["schedule"]
            .as_str()
            .context("Missing 'schedule' in heartbeat entry")?
            .to_string();

        let task = item["task"]
            .as_str()
            .context("Missing 'task' in heartbeat entry")?
            .to_string();

        let enabled = item["enabled"].as_bool().unwrap_or(true);
        let critical_allowed = item["criticalAllowed"].as_bool().unwrap_or(false);

        if !super::tasks::is_builtin(&task) {
            warn!("Heartbeat entry '{name}' references unknown task '{task}'");
        }

        entries.push(HeartbeatEntry {
            name,
            schedule,
            task,
            enabled,
            critical_allowed,
            last_run: None,
            next_run: None,
        });
    }

    Ok(HeartbeatConfig {
        entries,
        default_interval_ms,
        low_compute_multiplier,
    })
}

/// Load heartbeat configuration from a YAML file at the given path.
///
/// Falls back to the default configuration if the file does not exist.
pub fn load_heartbeat_config(config_path: &Path) -> Result<HeartbeatConfig> {
    if !config_path.exists() {
        info!(
            "Heartbeat config not found at {}, using defaults",
            config_path.display()
        );
        let docs = YamlLoader::load_from_str(DEFAULT_HEARTBEAT_CONFIG)
            .context("Failed to parse default heartbeat config")?;
        return parse_yaml_config(&docs);
    }

    let contents = fs::read_to_string(config_path).with_context(|| {
        format!(
            "Failed to read heartbeat config from {}",
            config_path.display()
        )
    })?;

    let docs = YamlLoader::load_from_str(&contents)
        .with_context(|| format!("Failed to parse YAML from {}", config_path.display()))?;

    let config = parse_yaml_config(&docs)?;
    debug!(
        "Loaded {} heartbeat entries from {}",
        config.entries.len(),
        config_path.display()
    );
    Ok(config)
}

/// Save heartbeat configuration to a YAML file at the given path.
pub fn save_heartbeat_config(config: &HeartbeatConfig, config_path: &Path) -> Result<()> {
    let mut yaml_str = String::from("entries:\n");

    for entry in &config.entries {
        yaml_str.push_str(&format!("  - name: {}\n", entry.name));
        yaml_str.push_str(&format!("    schedule: \"{}\"\n", entry.schedule));
        yaml_str.push_str(&format!("    task: {}\n", entry.task));
        yaml_str.push_str(&format!("    enabled: {}\n", entry.enabled));
        yaml_str.push_str(&format!(
            "    criticalAllowed: {}\n",
            entry.critical_allowed
        ));
    }

    yaml_str.push_str(&format!(
        "defaultIntervalMs: {}\n",
        config.default_interval_ms
    ));
    yaml_str.push_str(&format!(
        "lowComputeMultiplier: {}\n",
        config.low_compute_multiplier
    ));

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "Failed to create parent directory for {}",
                config_path.display()
            )
        })?;
    }

    fs::write(config_path, &yaml_str).with_context(|| {
        format!(
            "Failed to write heartbeat config to {}",
            config_path.display()
        )
    })?;

    info!("Saved heartbeat config to {}", config_path.display());
    Ok(())
}

/// Write the default heartbeat configuration to a file.
///
/// Will not overwrite an existing file.
pub fn write_default_heartbeat_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        warn!(
            "Heartbeat config already exists at {}, not overwriting",
            config_path.display()
        );
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "Failed to create parent directory for {}",
                config_path.display()
            )
        })?;
    }

    fs::write(config_path, DEFAULT_HEARTBEAT_CONFIG).with_context(|| {
        format!(
            "Failed to write default heartbeat config to {}",
            config_path.display()
        )
    })?;

    info!("Wrote default heartbeat config to {}", config_path.display());
    Ok(())
}

/// Synchronize heartbeat configuration entries to the database,
/// preserving `last_run` values already recorded there.
pub fn sync_heartbeat_to_db(config: &HeartbeatConfig, db: &Database) -> Result<()> {
    for entry in &config.entries {
        db.upsert_heartbeat_entry(entry)
            .with_context(|| format!("Failed to sync heartbeat entry '{}'", entry.name))?;
    }

    info!(
        "Synced {} heartbeat entries to database",
        config.entries.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let docs = YamlLoader::load_from_str(DEFAULT_HEARTBEAT_CONFIG).unwrap();
        let config = parse_yaml_config(&docs).unwrap();
        assert_eq!(config.entries.len(), 5);
        assert_eq!(config.default_interval_ms, 300_000);
        assert!((config.low_compute_multiplier - 4.0).abs() < f64::EPSILON);

        let ping = config
            .entries
            .iter()
            .find(|e| e.name == "heartbeat_ping")
            .unwrap();
        assert!(ping.critical_allowed);

        let inbox = config
            .entries
            .iter()
            .find(|e| e.name == "check_social_inbox")
            .unwrap();
        assert!(!inbox.critical_allowed);
    }

    #[test]
    fn default_schedules_are_five_field() {
        let docs = YamlLoader::load_from_str(DEFAULT_HEARTBEAT_CONFIG).unwrap();
        let config = parse_yaml_config(&docs).unwrap();
        for entry in &config.entries {
            assert_eq!(
                entry.schedule.split_whitespace().count(),
                5,
                "schedule for {} is not 5-field",
                entry.name
            );
        }
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.yml");

        let docs = YamlLoader::load_from_str(DEFAULT_HEARTBEAT_CONFIG).unwrap();
        let config = parse_yaml_config(&docs).unwrap();
        save_heartbeat_config(&config, &path).unwrap();

        let reloaded = load_heartbeat_config(&path).unwrap();
        assert_eq!(reloaded.entries.len(), config.entries.len());
        for (a, b) in reloaded.entries.iter().zip(config.entries.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.schedule, b.schedule);
            assert_eq!(a.critical_allowed, b.critical_allowed);
        }
    }

    #[test]
    fn sync_preserves_existing_last_run() {
        let db = Database::open_in_memory().unwrap();
        let docs = YamlLoader::load_from_str(DEFAULT_HEARTBEAT_CONFIG).unwrap();
        let config = parse_yaml_config(&docs).unwrap();

        sync_heartbeat_to_db(&config, &db).unwrap();
        db.update_heartbeat_last_run("heartbeat_ping", "2026-01-01T00:00:00+00:00")
            .unwrap();

        sync_heartbeat_to_db(&config, &db).unwrap();
        let entries = db.get_heartbeat_entries().unwrap();
        let ping = entries.iter().find(|e| e.name == "heartbeat_ping").unwrap();
        assert_eq!(
            ping.last_run.as_deref(),
            Some("2026-01-01T00:00:00+00:00")
        );
    }
}
