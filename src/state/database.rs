//! Automaton Database
//!
//! SQLite-backed persistent state for the automaton.
//! Uses rusqlite for synchronous, single-process access; the writer is
//! shared between the turn worker and the scheduler behind a mutex.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;

use crate::types::*;

use super::schema::{CREATE_TABLES, MIGRATION_V2, SCHEMA_VERSION};

/// KV key holding the social poll cursor.
pub const KV_SOCIAL_CURSOR: &str = "social_cursor";
/// KV key holding the cached liquid balance in hundredth-cents.
pub const KV_LIQUID_BALANCE: &str = "liquid_hundredth_cents";
/// KV key holding the current survival tier.
pub const KV_TIER: &str = "survival_tier";

/// The automaton's SQLite database handle.
///
/// All persistent state is stored here: turns, tool calls, inbox messages,
/// skills, children, the cost ledger, the model registry, heartbeat entries,
/// transactions, and key-value pairs.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at `db_path`, apply migrations, and
    /// return the handle.
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create db directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {db_path}"))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::migrate(&conn)?;

        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::migrate(&conn)?;
        Ok(Self { conn })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;

        let current_version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 2 {
            conn.execute_batch(MIGRATION_V2)
                .context("failed to apply migration v2")?;
        }

        if current_version < SCHEMA_VERSION {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                params![SCHEMA_VERSION],
            )
            .context("failed to update schema version")?;
        }

        Ok(())
    }

    // ─── Config Row ──────────────────────────────────────────────

    pub fn set_config_snapshot(&self, json: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO config (id, json, updated_at) VALUES (1, ?1, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at",
            params![json],
        )?;
        Ok(())
    }

    pub fn get_config_snapshot(&self) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row("SELECT json FROM config WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(result)
    }

    // ─── Turns ───────────────────────────────────────────────────

    /// Create the turn record at the start of a turn, in `building` state.
    pub fn insert_turn_started(
        &self,
        id: &str,
        timestamp: &str,
        input: Option<&str>,
        input_source: Option<InputSource>,
    ) -> Result<()> {
        let seq: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM turns", [], |row| {
                row.get(0)
            })?;
        self.conn.execute(
            "INSERT INTO turns (id, timestamp, status, input, input_source, seq)
             VALUES (?1, ?2, 'building', ?3, ?4, ?5)",
            params![id, timestamp, input, input_source.map(|s| s.as_str()), seq],
        )?;
        Ok(())
    }

    pub fn update_turn_status(&self, id: &str, status: TurnStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE turns SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Finalize a turn: write thinking, usage, cost, status and all tool
    /// call rows in one transaction so recovery never sees a half-written
    /// turn with pending tool-result rows.
    pub fn finalize_turn(&mut self, turn: &AgentTurn) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE turns SET status = ?1, thinking = ?2, tool_calls = ?3,
             tokens_in = ?4, tokens_out = ?5, model_id = ?6, cost_hundredth_cents = ?7
             WHERE id = ?8",
            params![
                turn.status.as_str(),
                turn.thinking,
                serde_json::to_string(&turn.tool_calls)?,
                turn.tokens_in,
                turn.tokens_out,
                turn.model_id,
                turn.cost_hundredth_cents,
                turn.id,
            ],
        )?;
        for (seq, call) in turn.tool_calls.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO tool_calls (id, turn_id, seq, name, arguments, result, error, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    call.id,
                    turn.id,
                    seq as i64,
                    call.name,
                    serde_json::to_string(&call.arguments)?,
                    call.result,
                    call.error,
                    call.duration_ms as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Crash recovery: mark every turn that never reached a terminal state
    /// as `aborted`, retaining its partial content for audit.
    pub fn abort_unfinalized_turns(&self) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE turns SET status = 'aborted'
             WHERE status NOT IN ('finalized', 'aborted')",
            [],
        )?;
        Ok(changed)
    }

    pub fn get_recent_turns(&self, limit: i64) -> Result<Vec<AgentTurn>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, status, input, input_source, thinking, tool_calls,
                    tokens_in, tokens_out, model_id, cost_hundredth_cents
             FROM turns ORDER BY seq DESC LIMIT ?1",
        )?;
        let mut turns: Vec<AgentTurn> = stmt
            .query_map(params![limit], |row| Ok(Self::deserialize_turn(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    pub fn get_turn_by_id(&self, id: &str) -> Result<Option<AgentTurn>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, timestamp, status, input, input_source, thinking, tool_calls,
                        tokens_in, tokens_out, model_id, cost_hundredth_cents
                 FROM turns WHERE id = ?1",
                params![id],
                |row| Ok(Self::deserialize_turn(row)),
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_turn_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))?;
        Ok(count)
    }

    // ─── Cost Ledger ─────────────────────────────────────────────

    pub fn append_ledger(&self, entry: &CostLedgerEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cost_ledger (timestamp, model_id, task_kind, tokens_in, tokens_out, cost_hundredth_cents, tier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.timestamp,
                entry.model_id,
                entry.task_kind.as_str(),
                entry.tokens_in,
                entry.tokens_out,
                entry.cost_hundredth_cents,
                entry.tier.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Sum of ledger costs since the RFC-3339 cutoff (exclusive lower bound
    /// is not needed; timestamps are compared lexicographically).
    pub fn ledger_sum_since(&self, cutoff: &str) -> Result<HundredthCents> {
        let sum: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(cost_hundredth_cents), 0) FROM cost_ledger WHERE timestamp >= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    /// Rolling 60-minute spend, in hundredth-cents.
    pub fn hourly_spend(&self) -> Result<HundredthCents> {
        let cutoff = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        self.ledger_sum_since(&cutoff)
    }

    pub fn ledger_entries_for_model(&self, model_id: &str) -> Result<Vec<CostLedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, model_id, task_kind, tokens_in, tokens_out, cost_hundredth_cents, tier
             FROM cost_ledger WHERE model_id = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![model_id], |row| Ok(Self::deserialize_ledger(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ─── Model Registry ──────────────────────────────────────────

    pub fn upsert_model(&self, model: &ModelEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO model_registry (model_id, provider, tier_minimum, cost_per_1k_input, cost_per_1k_output,
                                         max_tokens, context_window, supports_tools, enabled, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(model_id) DO UPDATE SET
               provider = excluded.provider,
               tier_minimum = excluded.tier_minimum,
               cost_per_1k_input = excluded.cost_per_1k_input,
               cost_per_1k_output = excluded.cost_per_1k_output,
               max_tokens = excluded.max_tokens,
               context_window = excluded.context_window,
               supports_tools = excluded.supports_tools,
               enabled = excluded.enabled",
            params![
                model.model_id,
                model.provider,
                model.tier_minimum.as_str(),
                model.cost_per_1k_input,
                model.cost_per_1k_output,
                model.max_tokens,
                model.context_window,
                model.supports_tools as i32,
                model.enabled as i32,
                model.last_seen,
            ],
        )?;
        Ok(())
    }

    /// Insert a model only if it is not already present, so runtime
    /// overrides survive reseeding of the static baseline.
    pub fn seed_model(&self, model: &ModelEntry) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO model_registry (model_id, provider, tier_minimum, cost_per_1k_input, cost_per_1k_output,
                                                   max_tokens, context_window, supports_tools, enabled, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                model.model_id,
                model.provider,
                model.tier_minimum.as_str(),
                model.cost_per_1k_input,
                model.cost_per_1k_output,
                model.max_tokens,
                model.context_window,
                model.supports_tools as i32,
                model.enabled as i32,
                model.last_seen,
            ],
        )?;
        Ok(())
    }

    pub fn get_model(&self, model_id: &str) -> Result<Option<ModelEntry>> {
        let result = self
            .conn
            .query_row(
                "SELECT model_id, provider, tier_minimum, cost_per_1k_input, cost_per_1k_output,
                        max_tokens, context_window, supports_tools, enabled, last_seen
                 FROM model_registry WHERE model_id = ?1",
                params![model_id],
                |row| Ok(Self::deserialize_model(row)),
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_models(&self) -> Result<Vec<ModelEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT model_id, provider, tier_minimum, cost_per_1k_input, cost_per_1k_output,
                    max_tokens, context_window, supports_tools, enabled, last_seen
             FROM model_registry ORDER BY model_id",
        )?;
        let models = stmt
            .query_map([], |row| Ok(Self::deserialize_model(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(models)
    }

    pub fn set_model_enabled(&self, model_id: &str, enabled: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE model_registry SET enabled = ?1 WHERE model_id = ?2",
            params![enabled as i32, model_id],
        )?;
        Ok(())
    }

    pub fn touch_model_last_seen(&self, model_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE model_registry SET last_seen = ?1 WHERE model_id = ?2",
            params![Utc::now().to_rfc3339(), model_id],
        )?;
        Ok(())
    }

    // ─── Inbox ───────────────────────────────────────────────────

    /// Ingest one poll's worth of messages and advance the cursor in a
    /// single transaction. Returns how many rows were newly inserted
    /// (insert-if-absent semantics keyed on the external id).
    pub fn ingest_inbox_batch(
        &mut self,
        messages: &[InboxMessage],
        next_cursor: Option<&str>,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0usize;
        for msg in messages {
            let received_at = if msg.received_at.is_empty() {
                Utc::now().to_rfc3339()
            } else {
                msg.received_at.clone()
            };
            let changed = tx.execute(
                "INSERT OR IGNORE INTO inbox_messages (id, from_address, to_address, content, signed_at, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![msg.id, msg.from, msg.to, msg.content, msg.signed_at, received_at],
            )?;
            inserted += changed;
        }
        if let Some(cursor) = next_cursor {
            tx.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![KV_SOCIAL_CURSOR, cursor],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// The oldest unprocessed message, in signed_at order
    /// (ties broken by received_at, then id).
    pub fn next_unprocessed_inbox(&self) -> Result<Option<InboxMessage>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, from_address, to_address, content, signed_at, received_at
                 FROM inbox_messages WHERE processed_at IS NULL
                 ORDER BY signed_at ASC, received_at ASC, id ASC LIMIT 1",
                [],
                |row| Ok(Self::deserialize_inbox(row)),
            )
            .optional()?;
        Ok(result)
    }

    pub fn unprocessed_inbox_count(&self) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM inbox_messages WHERE processed_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn mark_inbox_processed(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE inbox_messages SET processed_at = datetime('now')
             WHERE id = ?1 AND processed_at IS NULL",
            params![id],
        )?;
        Ok(())
    }

    // ─── Skills ─────────────────────────────────────────────────

    pub fn upsert_skill(&self, skill: &Skill) -> Result<()> {
        let requires_str = match &skill.requires {
            Some(r) => serde_json::to_string(r)?,
            None => "{}".to_string(),
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO skills (name, description, auto_activate, requires, instructions, source, path, enabled, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                skill.name,
                skill.description,
                skill.auto_activate as i32,
                requires_str,
                skill.instructions,
                skill.source.as_str(),
                skill.path,
                skill.enabled as i32,
                skill.installed_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_skill_by_name(&self, name: &str) -> Result<Option<Skill>> {
        let result = self
            .conn
            .query_row(
                "SELECT name, description, auto_activate, requires, instructions, source, path, enabled, installed_at
                 FROM skills WHERE name = ?1",
                params![name],
                |row| Ok(Self::deserialize_skill(row)),
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_skills(&self, enabled_only: bool) -> Result<Vec<Skill>> {
        let sql = if enabled_only {
            "SELECT name, description, auto_activate, requires, instructions, source, path, enabled, installed_at
             FROM skills WHERE enabled = 1"
        } else {
            "SELECT name, description, auto_activate, requires, instructions, source, path, enabled, installed_at
             FROM skills"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let skills = stmt
            .query_map([], |row| Ok(Self::deserialize_skill(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(skills)
    }

    pub fn set_skill_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE skills SET enabled = ?1 WHERE name = ?2",
            params![enabled as i32, name],
        )?;
        Ok(())
    }

    // ─── Children ──────────────────────────────────────────────

    pub fn insert_child(&self, child: &ChildAutomaton) -> Result<()> {
        self.conn.execute(
            "INSERT INTO children (id, name, sandbox_id, address, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                child.id,
                child.name,
                child.sandbox_id,
                child.address,
                child.status.as_str(),
                child.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_children(&self) -> Result<Vec<ChildAutomaton>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, sandbox_id, address, status, created_at, last_checked
             FROM children ORDER BY created_at DESC",
        )?;
        let children = stmt
            .query_map([], |row| Ok(Self::deserialize_child(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(children)
    }

    /// Status transitions are monotone toward `dead`; `unknown` is the only
    /// state a child may leave again.
    pub fn update_child_status(&self, id: &str, status: ChildStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE children SET status = ?1, last_checked = datetime('now')
             WHERE id = ?2 AND status != 'dead'",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    // ─── Heartbeat Entries ───────────────────────────────────────

    pub fn upsert_heartbeat_entry(&self, entry: &HeartbeatEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO heartbeat_entries (name, schedule, task, enabled, critical_allowed, last_run, next_run, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
             ON CONFLICT(name) DO UPDATE SET
               schedule = excluded.schedule,
               task = excluded.task,
               enabled = excluded.enabled,
               critical_allowed = excluded.critical_allowed,
               last_run = COALESCE(excluded.last_run, heartbeat_entries.last_run),
               updated_at = excluded.updated_at",
            params![
                entry.name,
                entry.schedule,
                entry.task,
                entry.enabled as i32,
                entry.critical_allowed as i32,
                entry.last_run,
                entry.next_run,
            ],
        )?;
        Ok(())
    }

    pub fn get_heartbeat_entries(&self) -> Result<Vec<HeartbeatEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, schedule, task, enabled, critical_allowed, last_run, next_run
             FROM heartbeat_entries",
        )?;
        let entries = stmt
            .query_map([], |row| Ok(Self::deserialize_heartbeat_entry(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn update_heartbeat_last_run(&self, name: &str, timestamp: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE heartbeat_entries SET last_run = ?1, updated_at = datetime('now') WHERE name = ?2",
            params![timestamp, name],
        )?;
        Ok(())
    }

    // ─── Liveness ────────────────────────────────────────────────

    pub fn insert_liveness(&self, tier: SurvivalTier, distress: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO liveness_log (at, tier, distress) VALUES (?1, ?2, ?3)",
            params![Utc::now().to_rfc3339(), tier.as_str(), distress as i32],
        )?;
        Ok(())
    }

    pub fn liveness_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM liveness_log", [], |row| row.get(0))?;
        Ok(count)
    }

    // ─── Transactions ────────────────────────────────────────────

    pub fn insert_transaction(&self, txn: &Transaction) -> Result<()> {
        self.conn.execute(
            "INSERT INTO transactions (id, type, amount_hundredth_cents, balance_after_hundredth_cents, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                txn.id,
                txn.tx_type.as_str(),
                txn.amount_hundredth_cents,
                txn.balance_after_hundredth_cents,
                txn.description,
                txn.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn get_recent_transactions(&self, limit: i64) -> Result<Vec<Transaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, type, amount_hundredth_cents, balance_after_hundredth_cents, description, created_at
             FROM transactions ORDER BY created_at DESC LIMIT ?1",
        )?;
        let mut txns: Vec<Transaction> = stmt
            .query_map(params![limit], |row| {
                let tx_type_str: String = row.get(1)?;
                Ok(Transaction {
                    id: row.get(0)?,
                    tx_type: TransactionType::parse(&tx_type_str),
                    amount_hundredth_cents: row.get(2)?,
                    balance_after_hundredth_cents: row.get(3)?,
                    description: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        txns.reverse();
        Ok(txns)
    }

    // ─── Key-Value Store ─────────────────────────────────────────

    pub fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(result)
    }

    pub fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_kv(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    // ─── Close ───────────────────────────────────────────────────

    /// Explicitly close the database connection. Also handled on drop.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| anyhow::anyhow!("failed to close database: {e}"))?;
        Ok(())
    }

    // ─── Deserializers (private) ─────────────────────────────────

    fn deserialize_turn(row: &rusqlite::Row<'_>) -> AgentTurn {
        let status_str: String = row.get(2).unwrap_or_default();
        let input_source_str: Option<String> = row.get(4).unwrap_or(None);
        let tool_calls_json: String = row.get(6).unwrap_or_default();

        AgentTurn {
            id: row.get(0).unwrap_or_default(),
            timestamp: row.get(1).unwrap_or_default(),
            status: TurnStatus::parse(&status_str).unwrap_or(TurnStatus::Aborted),
            input: row.get(3).unwrap_or(None),
            input_source: input_source_str.map(|s| InputSource::parse(&s)),
            thinking: row.get(5).unwrap_or_default(),
            tool_calls: serde_json::from_str(&tool_calls_json).unwrap_or_default(),
            tokens_in: row.get(7).unwrap_or(0),
            tokens_out: row.get(8).unwrap_or(0),
            model_id: row.get(9).unwrap_or(None),
            cost_hundredth_cents: row.get(10).unwrap_or(0),
        }
    }

    fn deserialize_ledger(row: &rusqlite::Row<'_>) -> CostLedgerEntry {
        let task_kind_str: String = row.get(2).unwrap_or_default();
        let tier_str: String = row.get(6).unwrap_or_default();

        CostLedgerEntry {
            timestamp: row.get(0).unwrap_or_default(),
            model_id: row.get(1).unwrap_or_default(),
            task_kind: TaskKind::parse(&task_kind_str).unwrap_or(TaskKind::AgentTurn),
            tokens_in: row.get(3).unwrap_or(0),
            tokens_out: row.get(4).unwrap_or(0),
            cost_hundredth_cents: row.get(5).unwrap_or(0),
            tier: SurvivalTier::parse(&tier_str).unwrap_or(SurvivalTier::Normal),
        }
    }

    fn deserialize_model(row: &rusqlite::Row<'_>) -> ModelEntry {
        let tier_str: String = row.get(2).unwrap_or_default();

        ModelEntry {
            model_id: row.get(0).unwrap_or_default(),
            provider: row.get(1).unwrap_or_default(),
            tier_minimum: SurvivalTier::parse(&tier_str).unwrap_or(SurvivalTier::Normal),
            cost_per_1k_input: row.get(3).unwrap_or(0),
            cost_per_1k_output: row.get(4).unwrap_or(0),
            max_tokens: row.get::<_, i64>(5).unwrap_or(4096) as u32,
            context_window: row.get::<_, i64>(6).unwrap_or(128_000) as u32,
            supports_tools: row.get::<_, i32>(7).unwrap_or(1) != 0,
            enabled: row.get::<_, i32>(8).unwrap_or(1) != 0,
            last_seen: row.get(9).unwrap_or(None),
        }
    }

    fn deserialize_inbox(row: &rusqlite::Row<'_>) -> InboxMessage {
        InboxMessage {
            id: row.get(0).unwrap_or_default(),
            from: row.get(1).unwrap_or_default(),
            to: row.get(2).unwrap_or_default(),
            content: row.get(3).unwrap_or_default(),
            signed_at: row.get(4).unwrap_or_default(),
            received_at: row.get(5).unwrap_or_default(),
            processed: false,
        }
    }

    fn deserialize_skill(row: &rusqlite::Row<'_>) -> Skill {
        let requires_json: String = row.get(3).unwrap_or_else(|_| "{}".to_string());
        let source_str: String = row.get(5).unwrap_or_default();

        Skill {
            name: row.get(0).unwrap_or_default(),
            description: row.get(1).unwrap_or_default(),
            auto_activate: row.get::<_, i32>(2).unwrap_or(0) != 0,
            requires: serde_json::from_str(&requires_json).ok(),
            instructions: row.get(4).unwrap_or_default(),
            source: SkillSource::parse(&source_str),
            path: row.get(6).unwrap_or_default(),
            enabled: row.get::<_, i32>(7).unwrap_or(0) != 0,
            installed_at: row.get(8).unwrap_or_default(),
        }
    }

    fn deserialize_child(row: &rusqlite::Row<'_>) -> ChildAutomaton {
        let status_str: String = row.get(4).unwrap_or_default();

        ChildAutomaton {
            id: row.get(0).unwrap_or_default(),
            name: row.get(1).unwrap_or_default(),
            sandbox_id: row.get(2).unwrap_or_default(),
            address: row.get(3).unwrap_or_default(),
            status: ChildStatus::parse(&status_str),
            created_at: row.get(5).unwrap_or_default(),
            last_checked: row.get(6).unwrap_or(None),
        }
    }

    fn deserialize_heartbeat_entry(row: &rusqlite::Row<'_>) -> HeartbeatEntry {
        HeartbeatEntry {
            name: row.get(0).unwrap_or_default(),
            schedule: row.get(1).unwrap_or_default(),
            task: row.get(2).unwrap_or_default(),
            enabled: row.get::<_, i32>(3).unwrap_or(0) != 0,
            critical_allowed: row.get::<_, i32>(4).unwrap_or(0) != 0,
            last_run: row.get(5).unwrap_or(None),
            next_run: row.get(6).unwrap_or(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, signed_at: &str) -> InboxMessage {
        InboxMessage {
            id: id.to_string(),
            from: "0xabc".to_string(),
            to: "0xdef".to_string(),
            content: "Hello!".to_string(),
            signed_at: signed_at.to_string(),
            received_at: "2026-01-01T00:00:00+00:00".to_string(),
            processed: false,
        }
    }

    #[test]
    fn inbox_dedup_across_overlapping_polls() {
        let mut db = Database::open_in_memory().unwrap();

        let first = db
            .ingest_inbox_batch(&[message("msg-1", "2026-01-01T00:00:00+00:00")], Some("c1"))
            .unwrap();
        assert_eq!(first, 1);

        let second = db
            .ingest_inbox_batch(&[message("msg-1", "2026-01-01T00:00:00+00:00")], Some("c2"))
            .unwrap();
        assert_eq!(second, 0);

        assert_eq!(db.unprocessed_inbox_count().unwrap(), 1);
        assert_eq!(db.get_kv(KV_SOCIAL_CURSOR).unwrap().as_deref(), Some("c2"));
    }

    #[test]
    fn inbox_consumed_in_signed_at_order() {
        let mut db = Database::open_in_memory().unwrap();
        db.ingest_inbox_batch(
            &[
                message("msg-b", "2026-01-01T00:05:00+00:00"),
                message("msg-a", "2026-01-01T00:01:00+00:00"),
            ],
            None,
        )
        .unwrap();

        let next = db.next_unprocessed_inbox().unwrap().unwrap();
        assert_eq!(next.id, "msg-a");
        db.mark_inbox_processed("msg-a").unwrap();

        let next = db.next_unprocessed_inbox().unwrap().unwrap();
        assert_eq!(next.id, "msg-b");
    }

    #[test]
    fn crash_recovery_aborts_unfinalized_turns() {
        let mut db = Database::open_in_memory().unwrap();
        db.insert_turn_started("t1", "2026-01-01T00:00:00+00:00", None, None)
            .unwrap();
        db.update_turn_status("t1", TurnStatus::AwaitingInference)
            .unwrap();

        let finalized = AgentTurn {
            id: "t2".to_string(),
            timestamp: "2026-01-01T00:01:00+00:00".to_string(),
            status: TurnStatus::Finalized,
            input: None,
            input_source: None,
            thinking: "done".to_string(),
            tool_calls: vec![],
            tokens_in: 10,
            tokens_out: 5,
            model_id: Some("gpt-4o".to_string()),
            cost_hundredth_cents: 7,
        };
        db.insert_turn_started("t2", &finalized.timestamp, None, None)
            .unwrap();
        db.finalize_turn(&finalized).unwrap();

        let aborted = db.abort_unfinalized_turns().unwrap();
        assert_eq!(aborted, 1);

        let t1 = db.get_turn_by_id("t1").unwrap().unwrap();
        assert_eq!(t1.status, TurnStatus::Aborted);
        let t2 = db.get_turn_by_id("t2").unwrap().unwrap();
        assert_eq!(t2.status, TurnStatus::Finalized);
    }

    #[test]
    fn ledger_hourly_sum_windows_correctly() {
        let db = Database::open_in_memory().unwrap();
        let recent = Utc::now() - chrono::Duration::minutes(10);
        let stale = Utc::now() - chrono::Duration::hours(3);

        for (ts, cost) in [(recent, 40), (stale, 500)] {
            db.append_ledger(&CostLedgerEntry {
                timestamp: ts.to_rfc3339(),
                model_id: "gpt-4o".to_string(),
                task_kind: TaskKind::AgentTurn,
                tokens_in: 100,
                tokens_out: 50,
                cost_hundredth_cents: cost,
                tier: SurvivalTier::Normal,
            })
            .unwrap();
        }

        assert_eq!(db.hourly_spend().unwrap(), 40);
    }

    #[test]
    fn model_seed_does_not_clobber_override() {
        let db = Database::open_in_memory().unwrap();
        let mut model = ModelEntry {
            model_id: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            tier_minimum: SurvivalTier::Normal,
            cost_per_1k_input: 25,
            cost_per_1k_output: 100,
            max_tokens: 4096,
            context_window: 128_000,
            supports_tools: true,
            enabled: true,
            last_seen: None,
        };
        db.seed_model(&model).unwrap();

        model.cost_per_1k_input = 30;
        db.upsert_model(&model).unwrap();

        // Reseeding the baseline must not undo the runtime override.
        model.cost_per_1k_input = 25;
        db.seed_model(&model).unwrap();
        assert_eq!(
            db.get_model("gpt-4o").unwrap().unwrap().cost_per_1k_input,
            30
        );
    }

    #[test]
    fn child_status_monotone_toward_dead() {
        let db = Database::open_in_memory().unwrap();
        db.insert_child(&ChildAutomaton {
            id: "c1".to_string(),
            name: "junior".to_string(),
            sandbox_id: "sb-1".to_string(),
            address: "0x1".to_string(),
            status: ChildStatus::Running,
            created_at: Utc::now().to_rfc3339(),
            last_checked: None,
        })
        .unwrap();

        db.update_child_status("c1", ChildStatus::Dead).unwrap();
        db.update_child_status("c1", ChildStatus::Running).unwrap();

        let children = db.get_children().unwrap();
        assert_eq!(children[0].status, ChildStatus::Dead);
    }
}
