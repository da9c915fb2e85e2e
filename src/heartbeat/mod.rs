//! Heartbeat Module
//!
//! Periodic task execution for the automaton: cron-driven scheduling,
//! tier throttling, built-in maintenance tasks, and the wake queue that
//! nudges the turn engine.

pub mod config;
pub mod scheduler;
pub mod tasks;
pub mod wake;

pub use config::{
    load_heartbeat_config, save_heartbeat_config, sync_heartbeat_to_db,
    write_default_heartbeat_config, DEFAULT_HEARTBEAT_CONFIG,
};
pub use scheduler::{HeartbeatScheduler, SchedulerOptions};
pub use tasks::{HeartbeatTaskResult, TaskContext, KV_USDC_BALANCE};
pub use wake::WakeQueue;
