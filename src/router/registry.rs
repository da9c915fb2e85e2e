//! Model Registry Baseline
//!
//! Static seed data for the model registry. Prices are integer
//! hundredth-cents per 1k tokens so cost arithmetic stays exact.
//! Runtime overrides live in the database and survive reseeding.

use anyhow::Result;

use crate::state::Database;
use crate::types::{ModelEntry, SurvivalTier};

fn entry(
    model_id: &str,
    provider: &str,
    tier_minimum: SurvivalTier,
    cost_per_1k_input: i64,
    cost_per_1k_output: i64,
    max_tokens: u32,
    context_window: u32,
) -> ModelEntry {
    ModelEntry {
        model_id: model_id.to_string(),
        provider: provider.to_string(),
        tier_minimum,
        cost_per_1k_input,
        cost_per_1k_output,
        max_tokens,
        context_window,
        supports_tools: true,
        enabled: true,
        last_seen: None,
    }
}

/// The static model baseline.
pub fn baseline_models() -> Vec<ModelEntry> {
    vec![
        entry("claude-sonnet-4-5", "anthropic", SurvivalTier::Normal, 30, 150, 8192, 200_000),
        entry("claude-haiku-4-5", "anthropic", SurvivalTier::Critical, 10, 50, 8192, 200_000),
        entry("gpt-4o", "openai", SurvivalTier::Normal, 25, 100, 4096, 128_000),
        entry("gpt-4o-mini", "openai", SurvivalTier::Critical, 2, 6, 4096, 128_000),
        entry("gpt-4.1", "openai", SurvivalTier::Normal, 20, 80, 8192, 128_000),
        entry("gpt-4.1-mini", "openai", SurvivalTier::Critical, 4, 16, 8192, 128_000),
        entry("gpt-4.1-nano", "openai", SurvivalTier::Critical, 1, 4, 4096, 128_000),
        entry("o4-mini", "openai", SurvivalTier::High, 11, 44, 16_384, 200_000),
    ]
}

/// Seed the registry with the baseline. Uses insert-if-absent so
/// runtime overrides already in the table are preserved.
pub fn seed_registry(db: &Database) -> Result<()> {
    for model in baseline_models() {
        db.seed_model(&model)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_has_cheap_models_at_every_tier() {
        let models = baseline_models();
        assert!(models
            .iter()
            .any(|m| m.tier_minimum == SurvivalTier::Critical));
        for m in &models {
            assert!(m.cost_per_1k_input >= 0);
            assert!(m.cost_per_1k_output >= 0);
        }
    }

    #[test]
    fn seeding_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        seed_registry(&db).unwrap();
        seed_registry(&db).unwrap();
        assert_eq!(db.list_models().unwrap().len(), baseline_models().len());
    }
}
