//! Survival Module
//!
//! Tier evaluation with hysteresis, tier broadcast, and resource
//! monitoring. Keeps the automaton alive by adapting compute usage to
//! what it can pay for.

pub mod controller;
pub mod monitor;

pub use controller::{
    load_persisted_tier, run_tier_watch, tier_for_balance, SurvivalController,
};
pub use monitor::{check_resources, format_resource_report, ResourceStatus};
