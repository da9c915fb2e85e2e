//! Resource Monitor
//!
//! Consolidated view of the automaton's resource levels (liquid balance,
//! hourly spend, pending work) used by the status command and the health
//! heartbeat task.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::{Database, KV_LIQUID_BALANCE};
use crate::survival::controller::tier_for_balance;
use crate::types::{HundredthCents, SurvivalTier};

/// Consolidated resource status for the automaton.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Liquid balance in hundredth-cents (platform credits + stablecoin).
    pub liquid_hundredth_cents: HundredthCents,
    /// Rolling 60-minute ledger spend in hundredth-cents.
    pub hourly_spend_hundredth_cents: HundredthCents,
    /// Tier implied by the balance alone, before hysteresis.
    pub raw_tier: SurvivalTier,
    /// Number of unprocessed inbox messages.
    pub pending_messages: u64,
    /// Total turns recorded so far.
    pub turn_count: u64,
    pub checked_at: String,
    pub warnings: Vec<String>,
}

/// Check all resource levels from the state store and return a
/// consolidated status.
pub fn check_resources(db: &Database) -> Result<ResourceStatus> {
    let now = Utc::now().to_rfc3339();
    let mut warnings: Vec<String> = Vec::new();

    let liquid: HundredthCents = db
        .get_kv(KV_LIQUID_BALANCE)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let hourly_spend = db.hourly_spend()?;
    let pending_messages = db.unprocessed_inbox_count()? as u64;
    let turn_count = db.get_turn_count()? as u64;

    let raw_tier = tier_for_balance(liquid);
    match raw_tier {
        SurvivalTier::Dead => warnings.push("No liquid balance remaining".to_string()),
        SurvivalTier::Critical => warnings.push(format!(
            "Balance critically low: {liquid} hundredth-cents"
        )),
        SurvivalTier::LowCompute => {
            warnings.push(format!("Balance low: {liquid} hundredth-cents"))
        }
        _ => {}
    }

    debug!(
        "Resource check: liquid={}hc, hourly={}hc, tier={}, msgs={}",
        liquid,
        hourly_spend,
        raw_tier.as_str(),
        pending_messages
    );

    Ok(ResourceStatus {
        liquid_hundredth_cents: liquid,
        hourly_spend_hundredth_cents: hourly_spend,
        raw_tier,
        pending_messages,
        turn_count,
        checked_at: now,
        warnings,
    })
}

/// Format a resource status into a human-readable report string.
pub fn format_resource_report(status: &ResourceStatus) -> String {
    let mut lines = Vec::new();

    lines.push("=== Resource Status Report ===".to_string());
    lines.push(format!("Checked at: {}", status.checked_at));
    lines.push(format!("Tier (by balance): {}", status.raw_tier.as_str()));
    lines.push(format!(
        "Liquid: {} hundredth-cents (${:.4})",
        status.liquid_hundredth_cents,
        status.liquid_hundredth_cents as f64 / 10_000.0
    ));
    lines.push(format!(
        "Hourly spend: {} hundredth-cents",
        status.hourly_spend_hundredth_cents
    ));
    lines.push(format!("Pending messages: {}", status.pending_messages));
    lines.push(format!("Turns completed: {}", status.turn_count));

    if !status.warnings.is_empty() {
        lines.push(String::new());
        lines.push("Warnings:".to_string());
        for warning in &status.warnings {
            lines.push(format!("  - {}", warning));
        }
    }

    lines.push("==============================".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_reports_dead_with_warning() {
        let db = Database::open_in_memory().unwrap();
        let status = check_resources(&db).unwrap();
        assert_eq!(status.raw_tier, SurvivalTier::Dead);
        assert_eq!(status.pending_messages, 0);
        assert!(!status.warnings.is_empty());
    }

    #[test]
    fn report_includes_tier_line() {
        let db = Database::open_in_memory().unwrap();
        db.set_kv(KV_LIQUID_BALANCE, "600").unwrap();
        let status = check_resources(&db).unwrap();
        assert_eq!(status.raw_tier, SurvivalTier::Normal);
        let report = format_resource_report(&status);
        assert!(report.contains("Tier (by balance): normal"));
    }
}
