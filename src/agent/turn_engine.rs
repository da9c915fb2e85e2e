//! The Turn Engine
//!
//! The core ReAct loop: Think -> Act -> Observe -> Persist. A turn moves
//! through building -> awaiting_inference -> dispatching_tools ->
//! finalized; anything the process leaves behind mid-flight is marked
//! aborted on the next startup. At most one turn is in flight at a time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{take_creator_message, AutomatonConfig};
use crate::heartbeat::WakeQueue;
use crate::router::{InferenceRouter, RouteRequest, RouterError};
use crate::skills::load_skills;
use crate::state::{Database, KV_LIQUID_BALANCE};
use crate::types::{
    AgentTurn, ChainProvider, FinancialState, InputSource, SandboxProvider, SocialProvider,
    SurvivalTier, TaskKind, ToolCallResult, TurnStatus, WalletSigner,
};

use super::context::{build_context_messages, split_for_summary, summarize_turns, PromptInput};
use super::injection_defense::sanitize_input;
use super::system_prompt::{build_system_prompt, build_wakeup_prompt};
use super::tools::{
    execute_tool, tool_definitions, ToolDispatchContext, ToolInvocation, MAX_TOOL_CALLS_PER_TURN,
};

/// Consecutive turn failures before the engine backs off into a long sleep.
const MAX_CONSECUTIVE_ERRORS: usize = 5;

/// Idle poll interval between trigger checks.
const IDLE_TICK_MS: u64 = 1_000;

/// Back-off sleep after repeated turn failures.
const ERROR_SLEEP_SECS: i64 = 300;

/// One gathered trigger for a turn.
struct PendingTurnInput {
    prompt: PromptInput,
    source: InputSource,
    /// Set when the input came from the inbox; marked processed on
    /// finalize.
    inbox_id: Option<String>,
}

pub struct TurnEngineOptions {
    pub config: AutomatonConfig,
    pub identity: crate::types::AutomatonIdentity,
    pub db: Arc<Mutex<Database>>,
    pub router: Arc<InferenceRouter>,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub social: Option<Arc<dyn SocialProvider>>,
    pub wallet: Arc<dyn WalletSigner>,
    pub chain: Option<Arc<dyn ChainProvider>>,
    pub wake: Arc<WakeQueue>,
    pub tier_rx: watch::Receiver<SurvivalTier>,
}

pub struct TurnEngine {
    config: AutomatonConfig,
    identity: crate::types::AutomatonIdentity,
    db: Arc<Mutex<Database>>,
    router: Arc<InferenceRouter>,
    tools_ctx: ToolDispatchContext,
    wake: Arc<WakeQueue>,
    tier_rx: watch::Receiver<SurvivalTier>,
    last_turn_at: Option<Instant>,
}

impl TurnEngine {
    pub fn new(options: TurnEngineOptions) -> Self {
        let TurnEngineOptions {
            config,
            identity,
            db,
            router,
            sandbox,
            social,
            wallet,
            chain,
            wake,
            tier_rx,
        } = options;

        let tools_ctx = ToolDispatchContext {
            config: config.clone(),
            agent_address: identity.address.clone(),
            db: db.clone(),
            sandbox,
            social,
            wallet,
            chain,
        };

        Self {
            config,
            identity,
            db,
            router,
            tools_ctx,
            wake,
            tier_rx,
            last_turn_at: None,
        }
    }

    /// Crash recovery: mark every non-terminal turn as aborted, keeping
    /// its partial content for audit.
    pub fn recover(&self) -> Result<usize> {
        let aborted = self
            .db
            .lock()
            .unwrap()
            .abort_unfinalized_turns()
            .context("turn recovery failed")?;
        if aborted > 0 {
            warn!("Recovered {aborted} unfinalized turn(s) as aborted");
        }
        Ok(aborted)
    }

    /// The turn worker loop. Returns when `shutdown` fires.
    pub async fn run_loop(&mut self, shutdown: CancellationToken) -> Result<()> {
        self.recover()?;
        let mut consecutive_errors: usize = 0;

        info!("[WAKE UP] {} is alive", self.config.name);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // No inference at the dead tier; the heartbeat's distress
            // ping is the only sign of life.
            if *self.tier_rx.borrow() == SurvivalTier::Dead {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(IDLE_TICK_MS)) => continue,
                }
            }

            if self.is_sleeping() && self.wake.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(IDLE_TICK_MS)) => continue,
                }
            }

            let Some(pending) = self.gather_input() else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(IDLE_TICK_MS)) => continue,
                }
            };

            match self.run_turn(pending).await {
                Ok(()) => {
                    consecutive_errors = 0;
                }
                Err(err) => {
                    consecutive_errors += 1;
                    error!("Turn failed: {err:#}");

                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        warn!(
                            "{MAX_CONSECUTIVE_ERRORS} consecutive turn failures; backing off"
                        );
                        let sleep_until = Utc::now() + chrono::Duration::seconds(ERROR_SLEEP_SECS);
                        let _ = self
                            .db
                            .lock()
                            .unwrap()
                            .set_kv("sleep_until", &sleep_until.to_rfc3339());
                        consecutive_errors = 0;
                    }
                }
            }
        }

        info!("Turn engine stopping");
        Ok(())
    }

    fn is_sleeping(&self) -> bool {
        let sleep_until = self.db.lock().unwrap().get_kv("sleep_until").ok().flatten();
        if let Some(s) = sleep_until {
            if let Ok(wake_time) = chrono::DateTime::parse_from_rfc3339(&s) {
                return wake_time > Utc::now();
            }
        }
        false
    }

    /// Gather at most one item of pending input. Preference order:
    /// creator message, then inbox, then wake signal, then the minimum
    /// turn interval.
    fn gather_input(&self) -> Option<PendingTurnInput> {
        if let Some(message) = take_creator_message() {
            // A wake or sleep no longer matters; the creator spoke.
            let _ = self.db.lock().unwrap().delete_kv("sleep_until");
            return Some(PendingTurnInput {
                prompt: PromptInput::Creator(message),
                source: InputSource::Creator,
                inbox_id: None,
            });
        }

        if let Ok(Some(message)) = self.db.lock().unwrap().next_unprocessed_inbox() {
            let sanitized = sanitize_input(&message.content, &message.from);
            return Some(PendingTurnInput {
                prompt: PromptInput::External(sanitized),
                source: InputSource::Inbox,
                inbox_id: Some(message.id),
            });
        }

        if let Some(signal) = self.wake.pop() {
            let _ = self.db.lock().unwrap().delete_kv("sleep_until");
            let text = format!("Heartbeat wake: {}", signal.reason);
            return Some(PendingTurnInput {
                prompt: PromptInput::External(sanitize_input(&text, &signal.source)),
                source: InputSource::Wake,
                inbox_id: None,
            });
        }

        let interval_elapsed = match self.last_turn_at {
            Some(at) => at.elapsed() >= Duration::from_secs(self.config.min_turn_interval_secs),
            None => true,
        };
        if interval_elapsed && !self.is_sleeping() {
            let financial = self.financial_snapshot();
            let wakeup = {
                let db = self.db.lock().unwrap();
                build_wakeup_prompt(&self.config, &financial, &db)
            };
            return Some(PendingTurnInput {
                prompt: PromptInput::Engine(wakeup),
                source: InputSource::Interval,
                inbox_id: None,
            });
        }

        None
    }

    fn financial_snapshot(&self) -> FinancialState {
        let db = self.db.lock().unwrap();
        let liquid = db
            .get_kv(KV_LIQUID_BALANCE)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let hourly = db.hourly_spend().unwrap_or(0);
        FinancialState {
            liquid_hundredth_cents: liquid,
            hourly_spend_hundredth_cents: hourly,
            last_checked: Utc::now().to_rfc3339(),
        }
    }

    /// Execute one full turn.
    async fn run_turn(&mut self, pending: PendingTurnInput) -> Result<()> {
        let turn_id = Uuid::new_v4().to_string();
        let timestamp = Utc::now().to_rfc3339();
        let input_text = pending.prompt.as_user_content();
        let tier = *self.tier_rx.borrow();

        // State-store write failures are fatal for the turn and, via the
        // caller's error counting, eventually for the process.
        self.db
            .lock()
            .unwrap()
            .insert_turn_started(&turn_id, &timestamp, Some(&input_text), Some(pending.source))
            .context("failed to open turn record")?;

        let mut turn = AgentTurn {
            id: turn_id.clone(),
            timestamp,
            status: TurnStatus::Building,
            input: Some(input_text),
            input_source: Some(pending.source),
            thinking: String::new(),
            tool_calls: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
            model_id: None,
            cost_hundredth_cents: 0,
        };

        // --- Build context ---

        let financial = self.financial_snapshot();
        let (history, turn_count, skills) = {
            let db = self.db.lock().unwrap();
            let history: Vec<AgentTurn> = db
                .get_recent_turns(self.config.context_turns as i64)?
                .into_iter()
                .filter(|t| t.status == TurnStatus::Finalized)
                .collect();
            let turn_count = db.get_turn_count()?;
            let skills = load_skills(&crate::config::resolve_path(&self.config.skills_dir), &db);
            (history, turn_count, skills)
        };

        let (summary, recent) = if turn_count > self.config.summary_threshold as i64 {
            let (older, newer) = split_for_summary(&history);
            let summary = summarize_turns(older, self.router.as_ref()).await;
            (Some(summary), newer.to_vec())
        } else {
            (None, history)
        };

        let system_prompt = {
            let db = self.db.lock().unwrap();
            build_system_prompt(&self.identity, &self.config, &financial, tier, &db, &skills)
        };

        let messages = build_context_messages(
            &system_prompt,
            summary.as_deref(),
            &recent,
            Some(&pending.prompt),
        );

        // --- Inference ---

        self.db
            .lock()
            .unwrap()
            .update_turn_status(&turn_id, TurnStatus::AwaitingInference)?;

        let mut request = RouteRequest::new(TaskKind::AgentTurn, messages);
        request.tools = Some(tool_definitions());

        let response = match self.router.dispatch(request).await {
            Ok(r) => r,
            Err(err @ (RouterError::BudgetExhausted { .. } | RouterError::NoEligibleModel { .. })) => {
                // Budget constraints become a finalized turn with a
                // synthetic note instead of an error.
                info!("Turn constrained: {err}");
                turn.status = TurnStatus::Finalized;
                turn.thinking = format!(
                    "[constrained] Inference withheld this turn: {err}. \
                     Conserving funds until the budget window clears or the balance recovers."
                );
                self.db.lock().unwrap().finalize_turn(&turn)?;
                self.consume_inbox(&pending);
                self.last_turn_at = Some(Instant::now());
                return Ok(());
            }
            Err(err) => {
                self.db
                    .lock()
                    .unwrap()
                    .update_turn_status(&turn_id, TurnStatus::Aborted)?;
                return Err(anyhow::anyhow!(err).context("inference dispatch failed"));
            }
        };

        turn.thinking = response.message.content.clone();
        turn.tokens_in = response.usage.prompt_tokens as i64;
        turn.tokens_out = response.usage.completion_tokens as i64;
        turn.model_id = Some(response.model_id.clone());
        turn.cost_hundredth_cents = response.cost_hundredth_cents;

        if !turn.thinking.is_empty() {
            let preview: String = turn.thinking.chars().take(300).collect();
            debug!("[THOUGHT] {preview}");
        }

        // --- Dispatch tool calls sequentially ---

        self.db
            .lock()
            .unwrap()
            .update_turn_status(&turn_id, TurnStatus::DispatchingTools)?;

        let tool_calls = response.tool_calls.unwrap_or_default();
        let mut outbound_used = false;

        for tc in tool_calls.iter().take(MAX_TOOL_CALLS_PER_TURN) {
            let args: serde_json::Value =
                serde_json::from_str(&tc.function.arguments).unwrap_or_default();

            let mut record = ToolCallResult {
                id: tc.id.clone(),
                name: tc.function.name.clone(),
                arguments: args.clone(),
                result: None,
                error: None,
                duration_ms: 0,
            };

            let started = Instant::now();
            let mut fatal = false;

            match ToolInvocation::parse(&tc.function.name, &args) {
                Err(parse_err) => {
                    record.error = Some(parse_err.to_string());
                }
                Ok(invocation) => {
                    if invocation.is_outbound() && outbound_used {
                        record.error =
                            Some("outbound action limit reached for this turn".to_string());
                    } else {
                        info!("[TOOL] {}", tc.function.name);
                        match execute_tool(&invocation, &self.tools_ctx).await {
                            Ok(result) => {
                                if invocation.is_outbound() {
                                    outbound_used = true;
                                }
                                record.result = Some(result);
                            }
                            Err(tool_err) => {
                                record.error = Some(tool_err.message.clone());
                                fatal = tool_err.fatal;
                            }
                        }
                    }
                }
            }

            record.duration_ms = started.elapsed().as_millis() as u64;
            if let Some(ref err) = record.error {
                warn!("[TOOL ERROR] {}: {err}", tc.function.name);
            }
            turn.tool_calls.push(record);

            if fatal {
                warn!("Fatal tool failure; aborting remainder of the turn's calls");
                break;
            }
        }

        // --- Finalize ---

        turn.status = TurnStatus::Finalized;
        self.db
            .lock()
            .unwrap()
            .finalize_turn(&turn)
            .context("failed to finalize turn")?;
        self.consume_inbox(&pending);
        self.last_turn_at = Some(Instant::now());

        Ok(())
    }

    fn consume_inbox(&self, pending: &PendingTurnInput) {
        if let Some(ref inbox_id) = pending.inbox_id {
            let _ = self.db.lock().unwrap().mark_inbox_processed(inbox_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::registry::seed_registry;
    use crate::types::{
        ChatMessage, ChatRole, ExecResult, HundredthCents, InboxMessage, InferenceError,
        InferenceOptions, InferenceProvider, InferenceResponse, InferenceToolCall,
        InferenceToolCallFunction, PortInfo, TokenUsage,
    };
    use async_trait::async_trait;
    use serde_json::json;

    /// Inference stub that replays a fixed script of tool calls.
    struct ScriptedInference {
        tool_calls: Vec<InferenceToolCall>,
    }

    #[async_trait]
    impl InferenceProvider for ScriptedInference {
        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            _options: InferenceOptions,
        ) -> Result<InferenceResponse, InferenceError> {
            Ok(InferenceResponse {
                id: "resp".into(),
                model: "gpt-4o".into(),
                message: ChatMessage {
                    role: ChatRole::Assistant,
                    content: "Acting on it.".into(),
                    tool_calls: None,
                    tool_call_id: None,
                },
                tool_calls: if self.tool_calls.is_empty() {
                    None
                } else {
                    Some(self.tool_calls.clone())
                },
                usage: TokenUsage {
                    prompt_tokens: 50,
                    completion_tokens: 20,
                    total_tokens: 70,
                },
                finish_reason: "stop".into(),
            })
        }
    }

    struct NullSandbox;

    #[async_trait]
    impl SandboxProvider for NullSandbox {
        async fn exec(&self, _command: &str, _timeout_ms: Option<u64>) -> Result<ExecResult> {
            Ok(ExecResult {
                stdout: "ok".into(),
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
                public_url: String::new(),
            })
        }
        async fn credits_balance(&self) -> Result<HundredthCents> {
            Ok(10_000)
        }
        async fn transfer_credits(&self, _to: &str, _amount: HundredthCents) -> Result<()> {
            Ok(())
        }
        async fn create_sandbox(&self, _name: &str) -> Result<String> {
            Ok("sb-child".into())
        }
        async fn sandbox_status(&self, _sandbox_id: &str) -> Result<String> {
            Ok("running".into())
        }
    }

    struct NullSigner;

    #[async_trait]
    impl WalletSigner for NullSigner {
        async fn sign_typed_data(
            &self,
            _domain: serde_json::Value,
            _types: serde_json::Value,
            _message: serde_json::Value,
        ) -> Result<String> {
            Ok("0xsigned".into())
        }
        fn address(&self) -> String {
            "0x0000000000000000000000000000000000000001".into()
        }
    }

    fn tool_call(id: &str, name: &str, args: serde_json::Value) -> InferenceToolCall {
        InferenceToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: InferenceToolCallFunction {
                name: name.to_string(),
                arguments: args.to_string(),
            },
        }
    }

    fn engine_with(
        tool_calls: Vec<InferenceToolCall>,
        tier: SurvivalTier,
    ) -> (TurnEngine, Arc<Mutex<Database>>, watch::Sender<SurvivalTier>) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        seed_registry(&db.lock().unwrap()).unwrap();

        let (tier_tx, tier_rx) = watch::channel(tier);
        let inference = Arc::new(ScriptedInference { tool_calls });
        let router = Arc::new(InferenceRouter::new(
            db.clone(),
            inference,
            tier_rx.clone(),
            2_000,
            1_000_000,
            true,
        ));

        let mut config = crate::config::default_config();
        config.name = "testling".into();

        let identity = crate::types::AutomatonIdentity {
            name: config.name.clone(),
            address: "0xme".into(),
            creator_address: "0xcreator".into(),
            sandbox_id: "sb-1".into(),
            created_at: Utc::now().to_rfc3339(),
        };

        let engine = TurnEngine::new(TurnEngineOptions {
            config,
            identity,
            db: db.clone(),
            router,
            sandbox: Arc::new(NullSandbox),
            social: None,
            wallet: Arc::new(NullSigner),
            chain: None,
            wake: Arc::new(WakeQueue::new()),
            tier_rx,
        });

        (engine, db, tier_tx)
    }

    fn pending_from_inbox(db: &Arc<Mutex<Database>>) -> PendingTurnInput {
        let msg = InboxMessage {
            id: "msg-1".into(),
            from: "0xpeer".into(),
            to: "0xme".into(),
            content: "Hello!".into(),
            signed_at: "2026-01-01T00:00:00+00:00".into(),
            received_at: "2026-01-01T00:00:01+00:00".into(),
            processed: false,
        };
        db.lock().unwrap().ingest_inbox_batch(&[msg.clone()], None).unwrap();
        PendingTurnInput {
            prompt: PromptInput::External(sanitize_input(&msg.content, &msg.from)),
            source: InputSource::Inbox,
            inbox_id: Some(msg.id),
        }
    }

    #[tokio::test]
    async fn plain_turn_finalizes_and_consumes_inbox() {
        let (mut engine, db, _tier_tx) = engine_with(vec![], SurvivalTier::Normal);
        let pending = pending_from_inbox(&db);

        engine.run_turn(pending).await.unwrap();

        let db = db.lock().unwrap();
        let turns = db.get_recent_turns(5).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].status, TurnStatus::Finalized);
        assert_eq!(turns[0].model_id.as_deref(), Some("gpt-4o"));
        assert!(turns[0].cost_hundredth_cents > 0);
        assert_eq!(db.unprocessed_inbox_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn constrained_tier_yields_synthetic_turn() {
        // Critical tier routes no agent_turn candidates.
        let (mut engine, db, _tier_tx) = engine_with(vec![], SurvivalTier::Critical);
        let pending = pending_from_inbox(&db);

        engine.run_turn(pending).await.unwrap();

        let db = db.lock().unwrap();
        let turns = db.get_recent_turns(5).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].status, TurnStatus::Finalized);
        assert!(turns[0].thinking.starts_with("[constrained]"));
        assert!(turns[0].model_id.is_none());
        // The inbox message is still consumed: the agent produced a turn.
        assert_eq!(db.unprocessed_inbox_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn second_outbound_action_is_refused() {
        let calls = vec![
            tool_call(
                "c1",
                "transfer_credits",
                json!({ "to": "0xpeer", "amount_hundredth_cents": 100 }),
            ),
            tool_call(
                "c2",
                "transfer_credits",
                json!({ "to": "0xother", "amount_hundredth_cents": 100 }),
            ),
        ];
        let (mut engine, db, _tier_tx) = engine_with(calls, SurvivalTier::Normal);
        let pending = pending_from_inbox(&db);

        engine.run_turn(pending).await.unwrap();

        let turns = db.lock().unwrap().get_recent_turns(5).unwrap();
        let tool_calls = &turns[0].tool_calls;
        assert_eq!(tool_calls.len(), 2);
        assert!(tool_calls[0].result.is_some());
        assert!(tool_calls[0].error.is_none());
        assert!(tool_calls[1].result.is_none());
        assert_eq!(
            tool_calls[1].error.as_deref(),
            Some("outbound action limit reached for this turn")
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_recorded_not_fatal() {
        let calls = vec![
            tool_call("c1", "launch_missiles", json!({})),
            tool_call("c2", "exec", json!({ "command": "echo hi" })),
        ];
        let (mut engine, db, _tier_tx) = engine_with(calls, SurvivalTier::Normal);
        let pending = pending_from_inbox(&db);

        engine.run_turn(pending).await.unwrap();

        let turns = db.lock().unwrap().get_recent_turns(5).unwrap();
        let tool_calls = &turns[0].tool_calls;
        assert_eq!(tool_calls.len(), 2);
        assert_eq!(
            tool_calls[0].error.as_deref(),
            Some("unknown tool: launch_missiles")
        );
        // The turn continued past the unknown tool.
        assert!(tool_calls[1].result.is_some());
    }

    #[tokio::test]
    async fn guarded_command_is_blocked_but_turn_continues() {
        let calls = vec![
            tool_call("c1", "exec", json!({ "command": "rm -rf ~/.automaton" })),
            tool_call("c2", "exec", json!({ "command": "echo fine" })),
        ];
        let (mut engine, db, _tier_tx) = engine_with(calls, SurvivalTier::Normal);
        let pending = pending_from_inbox(&db);

        engine.run_turn(pending).await.unwrap();

        let turns = db.lock().unwrap().get_recent_turns(5).unwrap();
        let tool_calls = &turns[0].tool_calls;
        assert!(tool_calls[0].error.as_deref().unwrap().starts_with("Blocked:"));
        assert!(tool_calls[1].result.is_some());
    }

    #[tokio::test]
    async fn every_completed_call_is_terminal() {
        let calls = vec![
            tool_call("c1", "exec", json!({ "command": "echo one" })),
            tool_call("c2", "launch_missiles", json!({})),
        ];
        let (mut engine, db, _tier_tx) = engine_with(calls, SurvivalTier::Normal);
        let pending = pending_from_inbox(&db);

        engine.run_turn(pending).await.unwrap();

        let turns = db.lock().unwrap().get_recent_turns(5).unwrap();
        for call in &turns[0].tool_calls {
            let terminal =
                call.result.is_some() as u8 + call.error.is_some() as u8;
            assert_eq!(terminal, 1, "call {} is not terminal", call.id);
        }
    }
}
