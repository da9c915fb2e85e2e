//! Survival Controller
//!
//! Maps the automaton's liquid balance to a discrete operating tier and
//! publishes tier changes to the scheduler and router. Downgrades apply
//! immediately; an upgrade must hold for two consecutive evaluations.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::{Database, KV_LIQUID_BALANCE, KV_TIER};
use crate::types::{
    HundredthCents, SurvivalTier, Transaction, TransactionType, TIER_THRESHOLD_CRITICAL,
    TIER_THRESHOLD_HIGH, TIER_THRESHOLD_LOW_COMPUTE, TIER_THRESHOLD_NORMAL,
};

/// Seconds between periodic tier re-evaluations.
const TIER_WATCH_INTERVAL_SECS: u64 = 60;

/// Consecutive evaluations a higher tier's threshold must hold before
/// the upgrade is applied.
const UPGRADE_CONFIRMATIONS: u32 = 2;

/// Pure mapping from liquid balance to tier, before hysteresis.
pub fn tier_for_balance(liquid: HundredthCents) -> SurvivalTier {
    if liquid >= TIER_THRESHOLD_HIGH {
        SurvivalTier::High
    } else if liquid >= TIER_THRESHOLD_NORMAL {
        SurvivalTier::Normal
    } else if liquid >= TIER_THRESHOLD_LOW_COMPUTE {
        SurvivalTier::LowCompute
    } else if liquid >= TIER_THRESHOLD_CRITICAL {
        SurvivalTier::Critical
    } else {
        SurvivalTier::Dead
    }
}

struct ControllerState {
    current: SurvivalTier,
    /// (candidate tier, evaluations it has held so far).
    pending_upgrade: Option<(SurvivalTier, u32)>,
}

/// Owns tier state and the single-writer broadcast channel.
pub struct SurvivalController {
    db: Arc<Mutex<Database>>,
    tier_tx: watch::Sender<SurvivalTier>,
    state: Mutex<ControllerState>,
    hourly_budget: HundredthCents,
}

impl SurvivalController {
    pub fn new(
        db: Arc<Mutex<Database>>,
        initial: SurvivalTier,
        hourly_budget: HundredthCents,
    ) -> Self {
        let (tier_tx, _) = watch::channel(initial);
        Self {
            db,
            tier_tx,
            state: Mutex::new(ControllerState {
                current: initial,
                pending_upgrade: None,
            }),
            hourly_budget,
        }
    }

    pub fn current(&self) -> SurvivalTier {
        self.state.lock().unwrap().current
    }

    pub fn subscribe(&self) -> watch::Receiver<SurvivalTier> {
        self.tier_tx.subscribe()
    }

    /// Run one evaluation against the given signals and return the
    /// (possibly unchanged) tier.
    ///
    /// A downgrade applies immediately. An upgrade candidate must hold for
    /// [`UPGRADE_CONFIRMATIONS`] consecutive evaluations; any evaluation
    /// that no longer supports it resets the confirmation count. An
    /// exhausted hourly budget caps the raw tier at `low_compute` until
    /// the window rolls over.
    pub fn evaluate(
        &self,
        liquid: HundredthCents,
        hourly_spend: HundredthCents,
    ) -> SurvivalTier {
        let mut raw = tier_for_balance(liquid);
        if hourly_spend >= self.hourly_budget && raw.rank() > SurvivalTier::LowCompute.rank() {
            raw = SurvivalTier::LowCompute;
        }

        let mut state = self.state.lock().unwrap();
        let previous = state.current;

        if raw.rank() < previous.rank() {
            state.current = raw;
            state.pending_upgrade = None;
        } else if raw.rank() > previous.rank() {
            match state.pending_upgrade {
                Some((candidate, held)) if raw.rank() >= candidate.rank() => {
                    if held + 1 >= UPGRADE_CONFIRMATIONS {
                        state.current = candidate;
                        state.pending_upgrade = None;
                    } else {
                        state.pending_upgrade = Some((candidate, held + 1));
                    }
                }
                _ => {
                    state.pending_upgrade = Some((raw, 1));
                }
            }
        } else {
            state.pending_upgrade = None;
        }

        let current = state.current;
        drop(state);

        if current != previous {
            self.record_transition(previous, current, liquid);
            let _ = self.tier_tx.send(current);
        }

        current
    }

    fn record_transition(
        &self,
        from: SurvivalTier,
        to: SurvivalTier,
        liquid: HundredthCents,
    ) {
        if to.rank() < from.rank() {
            warn!(
                "Tier downgrade: {} -> {} (liquid: {} hundredth-cents)",
                from.as_str(),
                to.as_str(),
                liquid
            );
        } else {
            info!(
                "Tier upgrade: {} -> {} (liquid: {} hundredth-cents)",
                from.as_str(),
                to.as_str(),
                liquid
            );
        }

        let db = self.db.lock().unwrap();
        let _ = db.set_kv(KV_TIER, to.as_str());
        let _ = db.insert_transaction(&Transaction {
            id: Uuid::new_v4().to_string(),
            tx_type: TransactionType::TierTransition,
            amount_hundredth_cents: None,
            balance_after_hundredth_cents: Some(liquid),
            description: format!("Tier transition: {} -> {}", from.as_str(), to.as_str()),
            timestamp: Utc::now().to_rfc3339(),
        });
    }
}

/// Restore the persisted tier from the KV store, defaulting to `normal`.
pub fn load_persisted_tier(db: &Database) -> SurvivalTier {
    db.get_kv(KV_TIER)
        .ok()
        .flatten()
        .and_then(|s| SurvivalTier::parse(&s))
        .unwrap_or(SurvivalTier::Normal)
}

/// The tier-watch worker: re-evaluates the tier on a 60 s timer and
/// whenever a balance check signals a change.
pub async fn run_tier_watch(
    controller: Arc<SurvivalController>,
    balance_changed: Arc<Notify>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Tier watch stopping");
                return Ok(());
            }
            _ = balance_changed.notified() => {}
            _ = tokio::time::sleep(Duration::from_secs(TIER_WATCH_INTERVAL_SECS)) => {}
        }

        let (liquid, hourly) = {
            let db = controller.db.lock().unwrap();
            let liquid = db
                .get_kv(KV_LIQUID_BALANCE)
                .ok()
                .flatten()
                .and_then(|v| v.parse::<HundredthCents>().ok())
                .unwrap_or(0);
            let hourly = db.hourly_spend().unwrap_or(0);
            (liquid, hourly)
        };

        controller.evaluate(liquid, hourly);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(initial: SurvivalTier) -> SurvivalController {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        SurvivalController::new(db, initial, 50_000)
    }

    #[test]
    fn balance_thresholds() {
        assert_eq!(tier_for_balance(5_000), SurvivalTier::High);
        assert_eq!(tier_for_balance(2_000), SurvivalTier::High);
        assert_eq!(tier_for_balance(1_999), SurvivalTier::Normal);
        assert_eq!(tier_for_balance(500), SurvivalTier::Normal);
        assert_eq!(tier_for_balance(499), SurvivalTier::LowCompute);
        assert_eq!(tier_for_balance(100), SurvivalTier::LowCompute);
        assert_eq!(tier_for_balance(99), SurvivalTier::Critical);
        assert_eq!(tier_for_balance(1), SurvivalTier::Critical);
        assert_eq!(tier_for_balance(0), SurvivalTier::Dead);
    }

    #[test]
    fn downgrade_is_immediate_upgrade_needs_two_evaluations() {
        let ctl = controller(SurvivalTier::High);

        // 2,500 -> 150: low_compute within one evaluation.
        assert_eq!(ctl.evaluate(150, 0), SurvivalTier::LowCompute);

        // Rises to 600 for one evaluation: tier holds.
        assert_eq!(ctl.evaluate(600, 0), SurvivalTier::LowCompute);

        // Second evaluation at 600: upgrade lands.
        assert_eq!(ctl.evaluate(600, 0), SurvivalTier::Normal);
    }

    #[test]
    fn upgrade_confirmation_resets_on_dip() {
        let ctl = controller(SurvivalTier::LowCompute);

        assert_eq!(ctl.evaluate(600, 0), SurvivalTier::LowCompute);
        // Dip back below the normal threshold clears the pending upgrade.
        assert_eq!(ctl.evaluate(300, 0), SurvivalTier::LowCompute);
        assert_eq!(ctl.evaluate(600, 0), SurvivalTier::LowCompute);
        assert_eq!(ctl.evaluate(600, 0), SurvivalTier::Normal);
    }

    #[test]
    fn tier_never_improves_without_balance_increase() {
        let ctl = controller(SurvivalTier::High);
        let balances = [1_800, 1_200, 450, 450, 80, 80, 0];
        let mut last_rank = SurvivalTier::High.rank();
        for liquid in balances {
            let tier = ctl.evaluate(liquid, 0);
            assert!(tier.rank() <= last_rank, "tier improved at liquid {liquid}");
            last_rank = tier.rank();
        }
        assert_eq!(ctl.current(), SurvivalTier::Dead);
    }

    #[test]
    fn exhausted_hourly_budget_caps_tier() {
        let ctl = controller(SurvivalTier::High);
        assert_eq!(ctl.evaluate(5_000, 50_000), SurvivalTier::LowCompute);
    }

    #[test]
    fn tier_change_is_broadcast() {
        let ctl = controller(SurvivalTier::Normal);
        let rx = ctl.subscribe();
        ctl.evaluate(50, 0);
        assert_eq!(*rx.borrow(), SurvivalTier::Critical);
    }

    #[test]
    fn mixed_upgrade_candidates_confirm_the_lower_tier() {
        let ctl = controller(SurvivalTier::LowCompute);
        // Normal threshold holds for both evaluations even though the
        // second reading would support high on its own.
        assert_eq!(ctl.evaluate(600, 0), SurvivalTier::LowCompute);
        assert_eq!(ctl.evaluate(2_500, 0), SurvivalTier::Normal);
    }
}
