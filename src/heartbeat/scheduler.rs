//! Heartbeat Scheduler
//!
//! Runs a background loop that checks cron schedules and executes due
//! heartbeat tasks serially. The tier throttles the schedule: low_compute
//! stretches every interval, critical restricts to explicitly allowed
//! tasks, dead leaves only the distress ping. Failing tasks degrade to a
//! doubled interval instead of taking the scheduler down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::types::{HeartbeatEntry, SurvivalTier};

use super::tasks::{run_task, HeartbeatTaskResult, TaskContext};
use super::wake::WakeQueue;

/// Consecutive failures after which a task is marked degraded.
const DEGRADE_AFTER_FAILURES: u32 = 3;

/// Options for creating the heartbeat scheduler.
pub struct SchedulerOptions {
    /// Tick interval in seconds. Defaults to 30.
    pub tick_interval_secs: u64,
    /// Heartbeat entries to schedule.
    pub entries: Vec<HeartbeatEntry>,
    /// Interval stretch applied while in the low_compute tier.
    pub low_compute_multiplier: f64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            entries: Vec::new(),
            low_compute_multiplier: 4.0,
        }
    }
}

/// A registered entry plus its runtime scheduling state.
#[derive(Clone, Debug)]
pub struct ScheduledEntry {
    pub def: HeartbeatEntry,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

impl ScheduledEntry {
    fn new(def: HeartbeatEntry) -> Self {
        Self {
            def,
            consecutive_failures: 0,
            degraded: false,
        }
    }
}

/// The heartbeat scheduler. Owns a background tokio task that ticks at a
/// fixed interval; all task executions within one tick run serially.
pub struct HeartbeatScheduler {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    tick_interval_secs: u64,
    low_compute_multiplier: f64,
    entries: Arc<tokio::sync::RwLock<Vec<ScheduledEntry>>>,
}

impl HeartbeatScheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            tick_interval_secs: options.tick_interval_secs,
            low_compute_multiplier: options.low_compute_multiplier,
            entries: Arc::new(tokio::sync::RwLock::new(
                options.entries.into_iter().map(ScheduledEntry::new).collect(),
            )),
        }
    }

    /// Start the background loop.
    pub fn start(&mut self, ctx: Arc<TaskContext>, wake: Arc<WakeQueue>) {
        if self.running.load(Ordering::SeqCst) {
            warn!("Heartbeat scheduler is already running");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            "Starting heartbeat scheduler with {}s tick interval",
            self.tick_interval_secs
        );

        let running = Arc::clone(&self.running);
        let entries = Arc::clone(&self.entries);
        let tick_secs = self.tick_interval_secs;
        let multiplier = self.low_compute_multiplier;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));

            loop {
                interval.tick().await;

                if !running.load(Ordering::SeqCst) {
                    info!("Heartbeat scheduler stopping");
                    break;
                }

                if let Err(e) = tick(&entries, &ctx, &wake, multiplier).await {
                    error!("Heartbeat tick error: {:#}", e);
                }
            }
        });

        self.handle = Some(handle);
    }

    /// Stop the scheduler gracefully.
    pub fn stop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("Heartbeat scheduler is not running");
            return;
        }

        info!("Stopping heartbeat scheduler");
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Force-run a specific task by name, regardless of its schedule or
    /// the current tier.
    pub async fn force_run(
        &self,
        task_name: &str,
        ctx: &TaskContext,
    ) -> Result<HeartbeatTaskResult> {
        let entries = self.entries.read().await;
        let entry = entries
            .iter()
            .find(|e| e.def.name == task_name)
            .cloned()
            .with_context(|| format!("No heartbeat entry found with name '{task_name}'"))?;
        drop(entries);

        info!("Force-running heartbeat task: {task_name}");
        run_task(&entry.def.task, ctx).await
    }
}

/// Parse a cron schedule. Accepts the standard 5-field form by
/// prefixing a zero seconds field.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    normalized
        .parse::<Schedule>()
        .with_context(|| format!("invalid cron schedule '{expr}'"))
}

/// Whether the tier permits this entry to run at all.
pub fn tier_permits(tier: SurvivalTier, entry: &HeartbeatEntry) -> bool {
    match tier {
        SurvivalTier::Dead => entry.task == "heartbeat_ping",
        SurvivalTier::Critical => entry.critical_allowed,
        _ => true,
    }
}

/// Whether an entry is due at `now`, with its interval stretched by
/// `factor` (tier throttling and degradation compose multiplicatively).
pub fn is_due(entry: &HeartbeatEntry, factor: f64, now: DateTime<Utc>) -> bool {
    if !entry.enabled {
        return false;
    }

    let schedule = match parse_schedule(&entry.schedule) {
        Ok(s) => s,
        Err(e) => {
            warn!(
                "Invalid cron schedule '{}' for entry '{}': {e:#}",
                entry.schedule, entry.name
            );
            return false;
        }
    };

    let last_run = match entry
        .last_run
        .as_deref()
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
    {
        Some(t) => t,
        // Never run before: due immediately.
        None => return true,
    };

    let next = match schedule.after(&last_run).next() {
        Some(n) => n,
        None => return false,
    };

    if factor <= 1.0 {
        return now >= next;
    }

    // Stretch the gap between last_run and the next scheduled fire,
    // advancing the effective next-fire time.
    let gap_ms = (next - last_run).num_milliseconds().max(0) as f64;
    let stretched = last_run + chrono::Duration::milliseconds((gap_ms * factor) as i64);
    now >= stretched
}

/// The interval stretch for an entry under the given tier.
fn stretch_factor(tier: SurvivalTier, degraded: bool, low_compute_multiplier: f64) -> f64 {
    let tier_factor = if tier == SurvivalTier::LowCompute {
        low_compute_multiplier
    } else {
        1.0
    };
    let degrade_factor = if degraded { 2.0 } else { 1.0 };
    tier_factor * degrade_factor
}

/// Perform a single tick: run every due entry serially, routing wake
/// requests to the queue and failure counts into degradation state.
pub async fn tick(
    entries: &tokio::sync::RwLock<Vec<ScheduledEntry>>,
    ctx: &TaskContext,
    wake: &WakeQueue,
    low_compute_multiplier: f64,
) -> Result<()> {
    let tier = *ctx.tier_rx.borrow();
    let now = Utc::now();
    let snapshot = entries.read().await.clone();

    for entry in &snapshot {
        if !tier_permits(tier, &entry.def) {
            continue;
        }
        let factor = stretch_factor(tier, entry.degraded, low_compute_multiplier);
        if !is_due(&entry.def, factor, now) {
            continue;
        }

        let name = entry.def.name.clone();
        debug!("Executing heartbeat task: {name} (task={})", entry.def.task);

        let outcome = run_task(&entry.def.task, ctx).await;
        let ran_at = Utc::now().to_rfc3339();

        let mut writable = entries.write().await;
        let state = match writable.iter_mut().find(|e| e.def.name == name) {
            Some(s) => s,
            None => continue,
        };
        state.def.last_run = Some(ran_at.clone());

        match outcome {
            Ok(result) => {
                if state.degraded {
                    info!("Task '{name}' recovered; clearing degraded state");
                }
                state.consecutive_failures = 0;
                state.degraded = false;

                if result.should_wake {
                    let reason = result
                        .message
                        .unwrap_or_else(|| format!("{name} requested wake"));
                    info!("Task '{name}' requests wake: {reason}");
                    wake.push(&name, &reason);
                }
            }
            Err(e) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= DEGRADE_AFTER_FAILURES && !state.degraded {
                    state.degraded = true;
                    warn!(
                        "Task '{name}' degraded after {} consecutive failures; interval doubled",
                        state.consecutive_failures
                    );
                }
                error!("Task '{name}' failed: {e:#}");
            }
        }
        drop(writable);

        let _ = ctx
            .db
            .lock()
            .unwrap()
            .update_heartbeat_last_run(&name, &ran_at);
    }

    Ok(())
}
