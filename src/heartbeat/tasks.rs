//! Built-in Heartbeat Tasks
//!
//! Each task is an async function that performs a specific maintenance
//! check and returns a `HeartbeatTaskResult` indicating whether the
//! turn engine should wake, with an optional reason.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::providers::chain::usdc_balance_hundredth_cents;
use crate::state::{Database, KV_LIQUID_BALANCE, KV_SOCIAL_CURSOR};
use crate::survival::controller::tier_for_balance;
use crate::types::{
    ChainProvider, HundredthCents, SandboxProvider, SocialProvider, SurvivalTier, Transaction,
    TransactionType,
};

/// KV key holding the cached on-chain stablecoin balance in hundredth-cents.
pub const KV_USDC_BALANCE: &str = "usdc_hundredth_cents";

/// Free disk below this many kilobytes degrades the health check.
const MIN_FREE_DISK_KB: u64 = 256 * 1024;

/// Result of a heartbeat task execution.
#[derive(Debug, Clone)]
pub struct HeartbeatTaskResult {
    /// Whether this result should cause the turn engine to wake.
    pub should_wake: bool,
    /// Optional human-readable message describing the result.
    pub message: Option<String>,
}

impl HeartbeatTaskResult {
    /// A result that does not request a wake.
    pub fn ok() -> Self {
        Self {
            should_wake: false,
            message: None,
        }
    }

    /// A result that does not request a wake, with a message.
    pub fn ok_with_message(msg: impl Into<String>) -> Self {
        Self {
            should_wake: false,
            message: Some(msg.into()),
        }
    }

    /// A result that requests the turn engine to wake.
    pub fn wake(msg: impl Into<String>) -> Self {
        Self {
            should_wake: true,
            message: Some(msg.into()),
        }
    }
}

/// Everything a heartbeat task may touch. Tasks hold no state of their
/// own; all durable effects go through the database.
pub struct TaskContext {
    pub agent_name: String,
    pub wallet_address: String,
    pub usdc_token_address: String,
    pub db: Arc<Mutex<Database>>,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub social: Option<Arc<dyn SocialProvider>>,
    pub chain: Option<Arc<dyn ChainProvider>>,
    pub tier_rx: watch::Receiver<SurvivalTier>,
    /// Signalled whenever a balance check lands, so the tier watch
    /// re-evaluates without waiting for its timer.
    pub balance_changed: Arc<Notify>,
}

impl TaskContext {
    fn tier(&self) -> SurvivalTier {
        *self.tier_rx.borrow()
    }
}

/// Built-in task names, in the order they ship in the default config.
pub const BUILTIN_TASK_NAMES: &[&str] = &[
    "heartbeat_ping",
    "check_credits",
    "check_usdc_balance",
    "check_social_inbox",
    "health_check",
];

pub fn is_builtin(task: &str) -> bool {
    BUILTIN_TASK_NAMES.contains(&task)
}

/// Dispatch a built-in task by name.
pub async fn run_task(task: &str, ctx: &TaskContext) -> Result<HeartbeatTaskResult> {
    match task {
        "heartbeat_ping" => heartbeat_ping(ctx).await,
        "check_credits" => check_credits(ctx).await,
        "check_usdc_balance" => check_usdc_balance(ctx).await,
        "check_social_inbox" => check_social_inbox(ctx).await,
        "health_check" => health_check(ctx).await,
        other => anyhow::bail!("no built-in task function for '{other}'"),
    }
}

/// Write a liveness record. Never wakes. In the dead tier this is the
/// distress ping: the record is flagged so the control plane can tell
/// "alive and broke" from "gone".
pub async fn heartbeat_ping(ctx: &TaskContext) -> Result<HeartbeatTaskResult> {
    let tier = ctx.tier();
    let distress = tier == SurvivalTier::Dead;

    ctx.db
        .lock()
        .unwrap()
        .insert_liveness(tier, distress)
        .context("failed to write liveness record")?;

    if distress {
        warn!("Distress ping: {} has no liquid balance", ctx.agent_name);
        return Ok(HeartbeatTaskResult::ok_with_message("Distress ping sent"));
    }

    debug!("Heartbeat ping for agent: {}", ctx.agent_name);
    Ok(HeartbeatTaskResult::ok_with_message("Ping sent"))
}

/// Refresh the liquid balance from the platform and the cached on-chain
/// figure. Wakes iff the refresh crossed down into low_compute or
/// critical territory so the agent can react to its own decline.
pub async fn check_credits(ctx: &TaskContext) -> Result<HeartbeatTaskResult> {
    let credits = ctx
        .sandbox
        .credits_balance()
        .await
        .context("failed to fetch platform credit balance")?;

    let (previous_liquid, usdc_cached) = {
        let db = ctx.db.lock().unwrap();
        let prev: HundredthCents = db
            .get_kv(KV_LIQUID_BALANCE)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let usdc: HundredthCents = db
            .get_kv(KV_USDC_BALANCE)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        (prev, usdc)
    };

    let liquid = credits + usdc_cached;

    {
        let db = ctx.db.lock().unwrap();
        db.set_kv(KV_LIQUID_BALANCE, &liquid.to_string())?;
        db.insert_transaction(&Transaction {
            id: Uuid::new_v4().to_string(),
            tx_type: TransactionType::CreditCheck,
            amount_hundredth_cents: Some(credits),
            balance_after_hundredth_cents: Some(liquid),
            description: format!(
                "Balance check: {credits}hc credits + {usdc_cached}hc stablecoin"
            ),
            timestamp: Utc::now().to_rfc3339(),
        })?;
    }

    ctx.balance_changed.notify_one();

    let previous_tier = tier_for_balance(previous_liquid);
    let new_tier = tier_for_balance(liquid);
    let crossed_down = new_tier.rank() < previous_tier.rank()
        && matches!(
            new_tier,
            SurvivalTier::LowCompute | SurvivalTier::Critical
        );

    if crossed_down {
        info!(
            "Balance fell into {} ({}hc), requesting wake",
            new_tier.as_str(),
            liquid
        );
        return Ok(HeartbeatTaskResult::wake(format!(
            "Balance fell to {}hc ({})",
            liquid,
            new_tier.as_str()
        )));
    }

    Ok(HeartbeatTaskResult::ok_with_message(format!(
        "Liquid balance: {liquid}hc"
    )))
}

/// Read the on-chain stablecoin balance and cache it. Additive to
/// check_credits: the next credit check folds this into the liquid figure.
pub async fn check_usdc_balance(ctx: &TaskContext) -> Result<HeartbeatTaskResult> {
    let chain = match &ctx.chain {
        Some(c) => c,
        None => {
            debug!("No chain provider configured; skipping USDC check");
            return Ok(HeartbeatTaskResult::ok());
        }
    };

    let balance = usdc_balance_hundredth_cents(
        chain.as_ref(),
        &ctx.usdc_token_address,
        &ctx.wallet_address,
    )
    .await
    .context("failed to read on-chain USDC balance")?;

    ctx.db
        .lock()
        .unwrap()
        .set_kv(KV_USDC_BALANCE, &balance.to_string())?;
    ctx.balance_changed.notify_one();

    Ok(HeartbeatTaskResult::ok_with_message(format!(
        "USDC balance: {balance}hc"
    )))
}

/// Poll the social relay from the stored cursor and ingest new messages.
/// Dedup is insert-if-absent on the external message id; the cursor
/// advances in the same transaction. Wakes iff at least one row was
/// newly inserted.
pub async fn check_social_inbox(ctx: &TaskContext) -> Result<HeartbeatTaskResult> {
    let social = match &ctx.social {
        Some(s) => s,
        None => {
            debug!("No social provider configured; skipping inbox poll");
            return Ok(HeartbeatTaskResult::ok());
        }
    };

    let cursor = ctx.db.lock().unwrap().get_kv(KV_SOCIAL_CURSOR)?;
    let response = social
        .poll(cursor.as_deref())
        .await
        .context("social poll failed")?;

    if response.messages.is_empty() {
        return Ok(HeartbeatTaskResult::ok_with_message("Inbox empty"));
    }

    let inserted = ctx
        .db
        .lock()
        .unwrap()
        .ingest_inbox_batch(&response.messages, response.next_cursor.as_deref())?;

    if inserted > 0 {
        info!("{inserted} new inbox message(s)");
        return Ok(HeartbeatTaskResult::wake(format!(
            "{inserted} new inbox message(s)"
        )));
    }

    Ok(HeartbeatTaskResult::ok_with_message(
        "No new messages after dedup",
    ))
}

/// Verify sandbox connectivity and disk space. Never wakes; degraded
/// findings surface through the log and the liveness trail.
pub async fn health_check(ctx: &TaskContext) -> Result<HeartbeatTaskResult> {
    let mut issues: Vec<String> = Vec::new();

    match ctx.sandbox.exec("df -Pk / | tail -1", Some(10_000)).await {
        Ok(result) if result.exit_code == 0 => {
            if let Some(free_kb) = parse_df_available_kb(&result.stdout) {
                if free_kb < MIN_FREE_DISK_KB {
                    issues.push(format!("low disk: {free_kb} KB free"));
                }
            }
        }
        Ok(result) => issues.push(format!("df exited with {}", result.exit_code)),
        Err(e) => issues.push(format!("sandbox exec unreachable: {e}")),
    }

    if ctx.db.lock().unwrap().get_kv("health_probe").is_err() {
        issues.push("state store read failed".to_string());
    }

    if issues.is_empty() {
        debug!("Health check: all systems nominal");
        Ok(HeartbeatTaskResult::ok_with_message("All systems nominal"))
    } else {
        let report = issues.join("; ");
        warn!("Health check found issues: {report}");
        Ok(HeartbeatTaskResult::ok_with_message(format!(
            "Health issues: {report}"
        )))
    }
}

/// Pull the "Available" column out of a `df -Pk` data line.
fn parse_df_available_kb(line: &str) -> Option<u64> {
    line.split_whitespace().nth(3)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecResult, InboxMessage, PollResponse, PortInfo, SendReceipt};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSandbox {
        credits: HundredthCents,
    }

    #[async_trait]
    impl SandboxProvider for StubSandbox {
        async fn exec(&self, _command: &str, _timeout_ms: Option<u64>) -> Result<ExecResult> {
            Ok(ExecResult {
                stdout: "/dev/vda1 10485760 2097152 8388608 20% /".to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
        async fn write_file(&self, _path: &str, _content: &str) -> Result<()> {
            Ok(())
        }
        async fn read_file(&self, _path: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn expose_port(&self, port: u16) -> Result<PortInfo> {
            Ok(PortInfo {
                port,
                public_url: format!("https://example.test:{port}"),
            })
        }
        async fn credits_balance(&self) -> Result<HundredthCents> {
            Ok(self.credits)
        }
        async fn transfer_credits(&self, _to: &str, _amount: HundredthCents) -> Result<()> {
            Ok(())
        }
        async fn create_sandbox(&self, _name: &str) -> Result<String> {
            Ok("sb-child".to_string())
        }
        async fn sandbox_status(&self, _sandbox_id: &str) -> Result<String> {
            Ok("running".to_string())
        }
    }

    struct RepeatingSocial {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl SocialProvider for RepeatingSocial {
        async fn poll(&self, _cursor: Option<&str>) -> Result<PollResponse> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(PollResponse {
                messages: vec![InboxMessage {
                    id: "msg-1".to_string(),
                    from: "0xpeer".to_string(),
                    to: "0xme".to_string(),
                    content: "Hello!".to_string(),
                    signed_at: "2026-01-01T00:00:00+00:00".to_string(),
                    received_at: "2026-01-01T00:00:01+00:00".to_string(),
                    processed: false,
                }],
                next_cursor: Some("cursor-1".to_string()),
            })
        }
        async fn send(&self, _to: &str, _content: &str) -> Result<SendReceipt> {
            Ok(SendReceipt {
                id: "sent-1".to_string(),
            })
        }
    }

    fn context(credits: HundredthCents, tier: SurvivalTier) -> (TaskContext, watch::Sender<SurvivalTier>) {
        let (tx, rx) = watch::channel(tier);
        let ctx = TaskContext {
            agent_name: "test-agent".to_string(),
            wallet_address: "0x0000000000000000000000000000000000000001".to_string(),
            usdc_token_address: "0x0000000000000000000000000000000000000002".to_string(),
            db: Arc::new(Mutex::new(Database::open_in_memory().unwrap())),
            sandbox: Arc::new(StubSandbox { credits }),
            social: Some(Arc::new(RepeatingSocial {
                polls: AtomicUsize::new(0),
            })),
            chain: None,
            tier_rx: rx,
            balance_changed: Arc::new(Notify::new()),
        };
        (ctx, tx)
    }

    #[tokio::test]
    async fn inbox_poll_wakes_once_then_dedups() {
        let (ctx, _tier_tx) = context(10_000, SurvivalTier::Normal);

        let first = check_social_inbox(&ctx).await.unwrap();
        assert!(first.should_wake);

        let second = check_social_inbox(&ctx).await.unwrap();
        assert!(!second.should_wake);

        let db = ctx.db.lock().unwrap();
        assert_eq!(db.unprocessed_inbox_count().unwrap(), 1);
        assert_eq!(
            db.get_kv(KV_SOCIAL_CURSOR).unwrap().as_deref(),
            Some("cursor-1")
        );
    }

    #[tokio::test]
    async fn check_credits_wakes_on_downward_crossing() {
        let (ctx, _tier_tx) = context(150, SurvivalTier::Normal);
        ctx.db
            .lock()
            .unwrap()
            .set_kv(KV_LIQUID_BALANCE, "2500")
            .unwrap();

        let result = check_credits(&ctx).await.unwrap();
        assert!(result.should_wake);
        assert_eq!(
            ctx.db
                .lock()
                .unwrap()
                .get_kv(KV_LIQUID_BALANCE)
                .unwrap()
                .as_deref(),
            Some("150")
        );
    }

    #[tokio::test]
    async fn check_credits_quiet_when_healthy() {
        let (ctx, _tier_tx) = context(10_000, SurvivalTier::Normal);
        ctx.db
            .lock()
            .unwrap()
            .set_kv(KV_LIQUID_BALANCE, "9000")
            .unwrap();

        let result = check_credits(&ctx).await.unwrap();
        assert!(!result.should_wake);
    }

    #[tokio::test]
    async fn ping_flags_distress_when_dead() {
        let (ctx, _tier_tx) = context(0, SurvivalTier::Dead);
        let result = heartbeat_ping(&ctx).await.unwrap();
        assert!(!result.should_wake);
        assert_eq!(result.message.as_deref(), Some("Distress ping sent"));
    }

    #[test]
    fn df_parsing() {
        assert_eq!(
            parse_df_available_kb("/dev/vda1 10485760 2097152 8388608 20% /"),
            Some(8_388_608)
        );
        assert_eq!(parse_df_available_kb("garbage"), None);
    }
}
