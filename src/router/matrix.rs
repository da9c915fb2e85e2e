//! Routing Matrix
//!
//! The (tier x task-kind) table of ordered model candidates, per-call
//! token limits, and cost ceilings. A ceiling of `-1` means the task has
//! no ceiling of its own and only the global per-call ceiling applies.

use crate::types::{
    HundredthCents, SurvivalTier, TaskKind, CRITICAL_TIER_CEILING,
};

/// Ceiling sentinel: unbounded per-task spend.
pub const CEILING_UNBOUNDED: HundredthCents = -1;

#[derive(Clone, Debug)]
pub struct RouteSpec {
    /// Model ids in preference order.
    pub candidates: Vec<String>,
    /// Completion token cap passed to the provider.
    pub max_tokens: u32,
    /// Per-call cost ceiling in hundredth-cents, or [`CEILING_UNBOUNDED`].
    pub ceiling_hundredth_cents: HundredthCents,
}

impl RouteSpec {
    fn new(candidates: &[&str], max_tokens: u32, ceiling: HundredthCents) -> Self {
        Self {
            candidates: candidates.iter().map(|s| s.to_string()).collect(),
            max_tokens,
            ceiling_hundredth_cents: ceiling,
        }
    }

    fn none() -> Self {
        Self {
            candidates: Vec::new(),
            max_tokens: 0,
            ceiling_hundredth_cents: 0,
        }
    }
}

/// Look up the route for a (tier, task) pair.
///
/// The dead tier routes nothing. The critical tier permits only
/// heartbeat triage and safety checks.
pub fn route_for(tier: SurvivalTier, task: TaskKind) -> RouteSpec {
    use SurvivalTier::*;
    use TaskKind::*;

    match (tier, task) {
        (Dead, _) => RouteSpec::none(),

        (Critical, HeartbeatTriage) => {
            RouteSpec::new(&["gpt-4.1-nano", "gpt-4o-mini"], 256, 100)
        }
        (Critical, SafetyCheck) => {
            RouteSpec::new(&["gpt-4.1-nano", "gpt-4o-mini"], 512, 200)
        }
        (Critical, _) => RouteSpec::none(),

        (LowCompute, AgentTurn) => {
            RouteSpec::new(&["gpt-4.1-mini", "gpt-4.1-nano"], 2048, 500)
        }
        (LowCompute, HeartbeatTriage) => {
            RouteSpec::new(&["gpt-4.1-nano", "gpt-4o-mini"], 256, 100)
        }
        (LowCompute, SafetyCheck) => {
            RouteSpec::new(&["gpt-4.1-mini", "gpt-4.1-nano"], 1024, 300)
        }
        // Summarization and planning are disabled while conserving compute.
        (LowCompute, Summarization) | (LowCompute, Planning) => RouteSpec::none(),

        (Normal, AgentTurn) => {
            RouteSpec::new(&["gpt-4o", "gpt-4.1-mini"], 4096, 2_000)
        }
        (Normal, HeartbeatTriage) => {
            RouteSpec::new(&["gpt-4.1-nano", "gpt-4o-mini"], 512, 100)
        }
        (Normal, SafetyCheck) => {
            RouteSpec::new(&["gpt-4.1-mini", "gpt-4.1-nano"], 1024, 300)
        }
        (Normal, Summarization) => {
            RouteSpec::new(&["gpt-4.1-mini", "gpt-4o-mini"], 1024, 500)
        }
        (Normal, Planning) => RouteSpec::new(&["gpt-4o", "gpt-4.1-mini"], 4096, 2_000),

        (High, AgentTurn) => RouteSpec::new(
            &["claude-sonnet-4-5", "gpt-4o", "gpt-4.1-mini"],
            8192,
            CEILING_UNBOUNDED,
        ),
        (High, HeartbeatTriage) => {
            RouteSpec::new(&["gpt-4.1-nano", "gpt-4o-mini"], 512, 100)
        }
        (High, SafetyCheck) => {
            RouteSpec::new(&["gpt-4.1-mini", "gpt-4.1-nano"], 1024, 300)
        }
        (High, Summarization) => {
            RouteSpec::new(&["gpt-4o-mini", "gpt-4.1-mini"], 2048, 500)
        }
        (High, Planning) => RouteSpec::new(
            &["claude-sonnet-4-5", "o4-mini", "gpt-4o"],
            8192,
            CEILING_UNBOUNDED,
        ),
    }
}

/// Resolve the effective per-call ceiling: the minimum of the finite
/// ceilings, with the critical tier forcing a hard cap of its own.
pub fn effective_ceiling(
    spec_ceiling: HundredthCents,
    global_ceiling: HundredthCents,
    tier: SurvivalTier,
) -> HundredthCents {
    let mut ceiling = if spec_ceiling == CEILING_UNBOUNDED {
        global_ceiling
    } else {
        spec_ceiling.min(global_ceiling)
    };
    if tier == SurvivalTier::Critical {
        ceiling = ceiling.min(CRITICAL_TIER_CEILING);
    }
    ceiling
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_tier_routes_nothing() {
        for task in [
            TaskKind::AgentTurn,
            TaskKind::HeartbeatTriage,
            TaskKind::SafetyCheck,
            TaskKind::Summarization,
            TaskKind::Planning,
        ] {
            assert!(route_for(SurvivalTier::Dead, task).candidates.is_empty());
        }
    }

    #[test]
    fn critical_tier_permits_only_triage_and_safety() {
        assert!(!route_for(SurvivalTier::Critical, TaskKind::HeartbeatTriage)
            .candidates
            .is_empty());
        assert!(!route_for(SurvivalTier::Critical, TaskKind::SafetyCheck)
            .candidates
            .is_empty());
        assert!(route_for(SurvivalTier::Critical, TaskKind::AgentTurn)
            .candidates
            .is_empty());
        assert!(route_for(SurvivalTier::Critical, TaskKind::Summarization)
            .candidates
            .is_empty());
        assert!(route_for(SurvivalTier::Critical, TaskKind::Planning)
            .candidates
            .is_empty());
    }

    #[test]
    fn low_compute_disables_summarization_and_planning() {
        assert!(route_for(SurvivalTier::LowCompute, TaskKind::Summarization)
            .candidates
            .is_empty());
        assert!(route_for(SurvivalTier::LowCompute, TaskKind::Planning)
            .candidates
            .is_empty());
        assert!(!route_for(SurvivalTier::LowCompute, TaskKind::AgentTurn)
            .candidates
            .is_empty());
    }

    #[test]
    fn unbounded_ceiling_falls_back_to_global() {
        assert_eq!(
            effective_ceiling(CEILING_UNBOUNDED, 2_000, SurvivalTier::High),
            2_000
        );
    }

    #[test]
    fn ceiling_takes_minimum_of_finite_values() {
        assert_eq!(effective_ceiling(500, 2_000, SurvivalTier::Normal), 500);
        assert_eq!(effective_ceiling(5_000, 2_000, SurvivalTier::Normal), 2_000);
    }

    #[test]
    fn critical_tier_forces_three_cent_cap() {
        assert_eq!(
            effective_ceiling(CEILING_UNBOUNDED, 2_000, SurvivalTier::Critical),
            CRITICAL_TIER_CEILING
        );
        assert_eq!(effective_ceiling(200, 2_000, SurvivalTier::Critical), 200);
    }
}
