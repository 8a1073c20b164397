//! MarketResolver
//!
//! Drives a scenario through its lifecycle and turns a terminal transition
//! (resolve or cancel) into ledger credits. The conditional status update in
//! the store is the only gate: whoever flips the row settles the scenario,
//! every other caller gets `AlreadyResolved` / `InvalidTransition`.
//!
//! Settlement after the gate is re-entrant. Payout rows are written `Pending`
//! before crediting and every credit carries the `('scenario', id)` reference,
//! so [`MarketResolver::retry_payouts`] can re-drive a partially paid
//! scenario without paying anyone twice.

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::events::{EventBus, SettlementEvent};
use crate::ledger::models::{TransactionType, TxReference};
use crate::ledger::recorder::{RecordRequest, TransactionRecorder};
use crate::ledger::store::LedgerStore;
use crate::market::payout::{self, SettlementPlan, UnfulfilledPolicy};
use crate::market::scenario::{
    Payout, PayoutStatus, Prediction, PredictionStatus, Scenario, ScenarioStatus, Side,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub scenario_id: String,
    pub status: ScenarioStatus,
    pub result: Option<Side>,
    pub pool_total: i64,
    pub winning_stake_total: i64,
    pub was_fulfilled: bool,
    /// Rounding remainder kept by the pool (or the whole pool under the house policy)
    pub retained: i64,
    pub payouts: Vec<Payout>,
    /// Recipients owed a credit that has not completed yet; non-zero means
    /// `retry_payouts` has work to do
    pub unsettled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedPrediction {
    pub prediction: Prediction,
    pub new_balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StealOutcome {
    pub scenario_id: String,
    pub amount: i64,
    pub from_balance: i64,
    pub to_balance: i64,
}

pub struct MarketResolver {
    recorder: Arc<TransactionRecorder>,
    store: Arc<dyn LedgerStore>,
    policy: UnfulfilledPolicy,
    max_concurrency: usize,
    events: EventBus,
}

impl MarketResolver {
    pub fn new(recorder: Arc<TransactionRecorder>, events: EventBus) -> Self {
        let store = recorder.store().clone();
        Self {
            recorder,
            store,
            policy: UnfulfilledPolicy::default(),
            max_concurrency: 16,
            events,
        }
    }

    pub fn with_policy(mut self, policy: UnfulfilledPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub async fn create_scenario(
        &self,
        title: &str,
        creator_id: Option<&str>,
    ) -> LedgerResult<Scenario> {
        let title = title.trim();
        if title.is_empty() {
            return Err(LedgerError::ValidationError(
                "scenario title must not be empty".to_string(),
            ));
        }

        let scenario = Scenario {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            creator_id: creator_id.map(str::to_string),
            status: ScenarioStatus::Draft,
            result: None,
            created_at: now_ms(),
            resolved_at: None,
        };
        self.store.create_scenario(scenario.clone()).await?;
        info!(scenario_id = %scenario.id, title = %scenario.title, "Created scenario");
        Ok(scenario)
    }

    pub async fn get_scenario(&self, scenario_id: &str) -> LedgerResult<Scenario> {
        self.store
            .get_scenario(scenario_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("scenario", scenario_id))
    }

    /// Draft -> Active
    pub async fn open(&self, scenario_id: &str) -> LedgerResult<Scenario> {
        self.transition(scenario_id, ScenarioStatus::Active).await
    }

    /// Active -> Closed: no more stakes, not yet resolved
    pub async fn close(&self, scenario_id: &str) -> LedgerResult<Scenario> {
        self.transition(scenario_id, ScenarioStatus::Closed).await
    }

    async fn transition(&self, scenario_id: &str, to: ScenarioStatus) -> LedgerResult<Scenario> {
        let scenario = self.get_scenario(scenario_id).await?;
        scenario.status.check_transition(to)?;

        let sources = ScenarioStatus::sources_for(to);
        if !self
            .store
            .transition_scenario(scenario_id, sources, to, None, now_ms())
            .await?
        {
            // Lost a race; report what the row moved to
            let current = self.get_scenario(scenario_id).await?;
            current.status.check_transition(to)?;
            return Err(LedgerError::InvalidTransition {
                from: current.status.to_string(),
                to: to.to_string(),
            });
        }

        info!(scenario_id, from = %scenario.status, to = %to, "Scenario transitioned");
        self.get_scenario(scenario_id).await
    }

    /// Stake `amount` on `side`. The stake is escrowed as a `PredictionBet`
    /// debit; if the scenario stops accepting stakes before the row lands,
    /// the debit is refunded.
    pub async fn place_prediction(
        &self,
        scenario_id: &str,
        user_id: &str,
        side: Side,
        amount: i64,
    ) -> LedgerResult<PlacedPrediction> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "stake must be positive, got {amount}"
            )));
        }
        let scenario = self.get_scenario(scenario_id).await?;
        if scenario.status != ScenarioStatus::Active {
            return Err(LedgerError::ValidationError(format!(
                "scenario {scenario_id} is {}, not accepting predictions",
                scenario.status
            )));
        }

        let prediction = Prediction {
            id: uuid::Uuid::new_v4().to_string(),
            scenario_id: scenario_id.to_string(),
            user_id: user_id.to_string(),
            side,
            amount,
            status: PredictionStatus::Pending,
            created_at: now_ms(),
        };

        let debit = self
            .recorder
            .record(
                RecordRequest::new(
                    user_id,
                    TransactionType::PredictionBet,
                    -amount,
                    &format!("Prediction on {}", scenario.title),
                )
                .with_reference(TxReference::prediction(&prediction.id))
                .with_metadata(serde_json::json!({
                    "scenario_id": scenario_id,
                    "side": side.as_str(),
                })),
            )
            .await?;

        let failure = match self.store.insert_prediction(prediction.clone()).await {
            Ok(true) => {
                debug!(scenario_id, user_id, amount, side = side.as_str(), "Prediction placed");
                return Ok(PlacedPrediction {
                    prediction,
                    new_balance: debit.new_balance,
                });
            }
            Ok(false) => LedgerError::ValidationError(format!(
                "scenario {scenario_id} stopped accepting predictions"
            )),
            Err(e) => e,
        };

        self.recorder
            .compensate(user_id, &debit.transaction_id, -amount, "prediction not placed")
            .await?;
        Err(failure)
    }

    /// Resolve the scenario with `result` and pay the winning side.
    pub async fn resolve(&self, scenario_id: &str, result: Side) -> LedgerResult<Resolution> {
        let sources = ScenarioStatus::sources_for(ScenarioStatus::Resolved);
        let gated = self
            .store
            .transition_scenario(
                scenario_id,
                sources,
                ScenarioStatus::Resolved,
                Some(result),
                now_ms(),
            )
            .await?;

        if !gated {
            let scenario = self.get_scenario(scenario_id).await?;
            return Err(match scenario.status {
                ScenarioStatus::Resolved => LedgerError::AlreadyResolved(scenario_id.to_string()),
                other => LedgerError::InvalidTransition {
                    from: other.to_string(),
                    to: ScenarioStatus::Resolved.to_string(),
                },
            });
        }
        info!(scenario_id, result = result.as_str(), "Scenario resolution gate passed");

        let predictions = self.store.predictions_for_scenario(scenario_id).await?;
        let plan = payout::settle(&predictions, result, self.policy)?;
        let resolution = self.apply_plan(scenario_id, &plan).await?;

        self.events.publish(SettlementEvent::ScenarioResolved {
            scenario_id: scenario_id.to_string(),
            result,
            pool_total: plan.pool_total,
            winning_stake_total: plan.winning_stake_total,
            was_fulfilled: plan.was_fulfilled,
            recipients: plan.payouts.len(),
            retained: plan.retained,
        });
        Ok(resolution)
    }

    /// Cancel the scenario and return every stake.
    pub async fn cancel(&self, scenario_id: &str) -> LedgerResult<Resolution> {
        let sources = ScenarioStatus::sources_for(ScenarioStatus::Cancelled);
        let gated = self
            .store
            .transition_scenario(
                scenario_id,
                sources,
                ScenarioStatus::Cancelled,
                None,
                now_ms(),
            )
            .await?;

        if !gated {
            let scenario = self.get_scenario(scenario_id).await?;
            return Err(LedgerError::InvalidTransition {
                from: scenario.status.to_string(),
                to: ScenarioStatus::Cancelled.to_string(),
            });
        }
        info!(scenario_id, "Scenario cancelled");

        let predictions = self.store.predictions_for_scenario(scenario_id).await?;
        let plan = payout::refund_all(&predictions)?;
        let resolution = self.apply_plan(scenario_id, &plan).await?;

        self.events.publish(SettlementEvent::ScenarioCancelled {
            scenario_id: scenario_id.to_string(),
            refunded: plan.payouts.len(),
        });
        Ok(resolution)
    }

    /// Re-drive settlement of a resolved or cancelled scenario. Rows already
    /// `Completed` are left alone; everything else is credited again under
    /// its original reference.
    pub async fn retry_payouts(&self, scenario_id: &str) -> LedgerResult<Resolution> {
        let scenario = self.get_scenario(scenario_id).await?;
        let predictions = self.store.predictions_for_scenario(scenario_id).await?;

        let plan = match (scenario.status, scenario.result) {
            (ScenarioStatus::Resolved, Some(result)) => {
                payout::settle(&predictions, result, self.policy)?
            }
            (ScenarioStatus::Resolved, None) => {
                return Err(LedgerError::InternalError(format!(
                    "scenario {scenario_id} resolved without a result"
                )))
            }
            (ScenarioStatus::Cancelled, _) => payout::refund_all(&predictions)?,
            (other, _) => {
                return Err(LedgerError::ValidationError(format!(
                    "scenario {scenario_id} is {other}, nothing to settle"
                )))
            }
        };

        info!(scenario_id, "Retrying scenario payouts");
        self.apply_plan(scenario_id, &plan).await
    }

    pub async fn payouts(&self, scenario_id: &str) -> LedgerResult<Vec<Payout>> {
        self.get_scenario(scenario_id).await?;
        self.store.payouts_for_scenario(scenario_id).await
    }

    /// Move coins between two users inside a scenario's steal pool.
    ///
    /// Two `ScenarioSteal` entries share one reference, one per account, so a
    /// retried steal is a no-op. A failed credit compensates the debit.
    pub async fn steal(
        &self,
        scenario_id: &str,
        from_user: &str,
        to_user: &str,
        amount: i64,
        steal_ref: &str,
    ) -> LedgerResult<StealOutcome> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "steal amount must be positive, got {amount}"
            )));
        }
        if from_user == to_user {
            return Err(LedgerError::ValidationError(
                "cannot steal from yourself".to_string(),
            ));
        }
        let scenario = self.get_scenario(scenario_id).await?;
        if scenario.status.is_terminal() {
            return Err(LedgerError::ValidationError(format!(
                "scenario {scenario_id} is {}",
                scenario.status
            )));
        }

        let reference = TxReference::new("scenario_steal", &format!("{scenario_id}:{steal_ref}"));
        let debit = self
            .recorder
            .record(
                RecordRequest::new(
                    from_user,
                    TransactionType::ScenarioSteal,
                    -amount,
                    &format!("Stolen in {}", scenario.title),
                )
                .with_reference(reference.clone())
                .with_metadata(serde_json::json!({ "to": to_user })),
            )
            .await?;

        if debit.replayed
            && self
                .recorder
                .is_compensated(from_user, &debit.transaction_id)
                .await?
        {
            // Debit of the earlier attempt was reversed
            return Err(LedgerError::ValidationError(format!(
                "steal {steal_ref} in scenario {scenario_id} was reversed; use a new steal ref"
            )));
        }

        let credit = self
            .recorder
            .record(
                RecordRequest::new(
                    to_user,
                    TransactionType::ScenarioSteal,
                    amount,
                    &format!("Stole in {}", scenario.title),
                )
                .with_reference(reference)
                .with_metadata(serde_json::json!({ "from": from_user })),
            )
            .await;

        match credit {
            Ok(credit) => {
                info!(scenario_id, from_user, to_user, amount, "Steal recorded");
                Ok(StealOutcome {
                    scenario_id: scenario_id.to_string(),
                    amount,
                    from_balance: debit.new_balance,
                    to_balance: credit.new_balance,
                })
            }
            Err(e) => {
                self.recorder
                    .compensate(from_user, &debit.transaction_id, -amount, "steal credit failed")
                    .await?;
                Err(e)
            }
        }
    }

    /// Settle predictions, write payout rows, then credit every row that is
    /// not yet `Completed`, at most `max_concurrency` at a time.
    async fn apply_plan(&self, scenario_id: &str, plan: &SettlementPlan) -> LedgerResult<Resolution> {
        for (prediction_id, status) in &plan.outcomes {
            self.store.settle_prediction(prediction_id, *status).await?;
        }

        let mut writable = Vec::with_capacity(plan.payouts.len());
        for line in &plan.payouts {
            let row = Payout {
                id: uuid::Uuid::new_v4().to_string(),
                scenario_id: scenario_id.to_string(),
                recipient_id: line.recipient_id.clone(),
                payout_amount: line.amount,
                pool_total: plan.pool_total,
                was_fulfilled: plan.was_fulfilled,
                status: PayoutStatus::Pending,
                transaction_id: None,
                created_at: now_ms(),
            };
            match self.store.insert_payout(row).await {
                Ok(_) => writable.push((line.recipient_id.clone(), line.amount)),
                Err(e) => {
                    // Without a row nothing is credited; a retry writes it
                    warn!(
                        scenario_id,
                        recipient_id = %line.recipient_id,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Payout row not written"
                    );
                    self.events.publish(SettlementEvent::PayoutFailed {
                        scenario_id: scenario_id.to_string(),
                        recipient_id: line.recipient_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let existing: HashMap<String, PayoutStatus> = self
            .store
            .payouts_for_scenario(scenario_id)
            .await?
            .into_iter()
            .map(|p| (p.recipient_id, p.status))
            .collect();
        let due: Vec<(String, i64)> = writable
            .into_iter()
            .filter(|(recipient, _)| existing.get(recipient) != Some(&PayoutStatus::Completed))
            .collect();

        let kind = if plan.was_fulfilled {
            TransactionType::ScenarioPayout
        } else {
            TransactionType::Refund
        };

        let credited: Vec<bool> = stream::iter(due)
            .map(|(recipient, amount)| async move {
                self.credit(scenario_id, kind, plan, &recipient, amount).await
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
        let failed = credited.iter().filter(|ok| !**ok).count();
        if failed > 0 {
            warn!(scenario_id, failed, "Some payouts failed; retry to complete");
        }

        let scenario = self.get_scenario(scenario_id).await?;
        let payouts = self.store.payouts_for_scenario(scenario_id).await?;
        let completed = payouts
            .iter()
            .filter(|p| p.status == PayoutStatus::Completed)
            .count();
        Ok(Resolution {
            scenario_id: scenario_id.to_string(),
            status: scenario.status,
            result: scenario.result,
            pool_total: plan.pool_total,
            winning_stake_total: plan.winning_stake_total,
            was_fulfilled: plan.was_fulfilled,
            retained: plan.retained,
            unsettled: plan.payouts.len().saturating_sub(completed),
            payouts,
        })
    }

    /// Credit one recipient and record the row's final status.
    async fn credit(
        &self,
        scenario_id: &str,
        kind: TransactionType,
        plan: &SettlementPlan,
        recipient_id: &str,
        amount: i64,
    ) -> bool {
        if amount == 0 {
            // Share rounded to nothing; the row is final as is
            return self
                .store
                .update_payout(scenario_id, recipient_id, PayoutStatus::Completed, None)
                .await
                .is_ok();
        }

        let description = if plan.was_fulfilled {
            "Scenario payout"
        } else {
            "Scenario stake refund"
        };
        let req = RecordRequest::new(recipient_id, kind, amount, description)
            .with_reference(TxReference::scenario(scenario_id))
            .with_metadata(serde_json::json!({
                "pool_total": plan.pool_total,
                "winning_stake_total": plan.winning_stake_total,
                "was_fulfilled": plan.was_fulfilled,
            }));

        let (status, tx_id, error) = match self.recorder.record(req).await {
            Ok(outcome) => (PayoutStatus::Completed, Some(outcome.transaction_id), None),
            Err(e) => {
                warn!(
                    scenario_id,
                    recipient_id,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Payout credit failed"
                );
                (PayoutStatus::Failed, None, Some(e))
            }
        };

        if let Err(e) = self
            .store
            .update_payout(scenario_id, recipient_id, status, tx_id.as_deref())
            .await
        {
            warn!(scenario_id, recipient_id, error = %e, "Payout status not updated");
        }

        match error {
            None => true,
            Some(e) => {
                self.events.publish(SettlementEvent::PayoutFailed {
                    scenario_id: scenario_id.to_string(),
                    recipient_id: recipient_id.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::{FaultPoint, InMemoryLedgerStore};

    struct Fixture {
        store: Arc<InMemoryLedgerStore>,
        recorder: Arc<TransactionRecorder>,
        resolver: MarketResolver,
    }

    async fn fixture(policy: UnfulfilledPolicy, users: &[&str]) -> Fixture {
        let store = Arc::new(InMemoryLedgerStore::new());
        let recorder = Arc::new(TransactionRecorder::new(store.clone()).with_welcome_bonus(10_000));
        for user in users {
            recorder.open_account(user, false).await.unwrap();
        }
        let resolver = MarketResolver::new(recorder.clone(), EventBus::default()).with_policy(policy);
        Fixture {
            store,
            recorder,
            resolver,
        }
    }

    async fn active_scenario(resolver: &MarketResolver) -> String {
        let scenario = resolver.create_scenario("Will it ship?", None).await.unwrap();
        resolver.open(&scenario.id).await.unwrap();
        scenario.id
    }

    async fn balance(recorder: &TransactionRecorder, user: &str) -> i64 {
        recorder.wallet_stats(user).await.unwrap().balance
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_settlement_futures_are_send() {
        let f = fixture(UnfulfilledPolicy::Refund, &["user"]).await;
        let id = active_scenario(&f.resolver).await;
        f.resolver.place_prediction(&id, "user", Side::Yes, 100).await.unwrap();

        let resolve = f.resolver.resolve(&id, Side::Yes);
        assert_send(&resolve);
        resolve.await.unwrap();

        let retry = f.resolver.retry_payouts(&id);
        assert_send(&retry);
        retry.await.unwrap();

        let cancel = f.resolver.cancel("missing");
        assert_send(&cancel);
        assert!(cancel.await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_pays_proportional_share() {
        let f = fixture(UnfulfilledPolicy::Refund, &["crowd", "early", "user"]).await;
        let id = active_scenario(&f.resolver).await;

        f.resolver.place_prediction(&id, "crowd", Side::Yes, 7500).await.unwrap();
        f.resolver.place_prediction(&id, "early", Side::No, 2000).await.unwrap();
        f.resolver.place_prediction(&id, "user", Side::No, 500).await.unwrap();
        assert_eq!(balance(&f.recorder, "user").await, 9500);

        let resolution = f.resolver.resolve(&id, Side::No).await.unwrap();
        assert_eq!(resolution.pool_total, 10_000);
        assert_eq!(resolution.winning_stake_total, 2500);
        assert!(resolution.was_fulfilled);
        assert_eq!(resolution.unsettled, 0);
        assert_eq!(resolution.payouts.len(), 2);
        assert!(resolution
            .payouts
            .iter()
            .all(|p| p.status == PayoutStatus::Completed && p.transaction_id.is_some()));

        assert_eq!(balance(&f.recorder, "user").await, 9500 + 2000);
        assert_eq!(balance(&f.recorder, "early").await, 8000 + 8000);
        assert_eq!(balance(&f.recorder, "crowd").await, 2500);

        let predictions = f.store.predictions_for_scenario(&id).await.unwrap();
        assert!(predictions
            .iter()
            .all(|p| p.status != PredictionStatus::Pending));
    }

    #[tokio::test]
    async fn test_resolve_twice_is_rejected_without_side_effects() {
        let f = fixture(UnfulfilledPolicy::Refund, &["a", "b"]).await;
        let id = active_scenario(&f.resolver).await;
        f.resolver.place_prediction(&id, "a", Side::Yes, 100).await.unwrap();
        f.resolver.place_prediction(&id, "b", Side::No, 100).await.unwrap();

        f.resolver.resolve(&id, Side::Yes).await.unwrap();
        let entries = f.store.all_transactions().len();

        let err = f.resolver.resolve(&id, Side::Yes).await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyResolved(id.clone()));
        let err = f.resolver.resolve(&id, Side::No).await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyResolved(id.clone()));

        assert_eq!(f.store.all_transactions().len(), entries);
        assert_eq!(f.resolver.payouts(&id).await.unwrap().len(), 1);
        assert_eq!(balance(&f.recorder, "a").await, 10_100);
    }

    #[tokio::test]
    async fn test_concurrent_resolve_has_one_winner() {
        let f = fixture(UnfulfilledPolicy::Refund, &["a", "b"]).await;
        let resolver = Arc::new(f.resolver);
        let id = active_scenario(&resolver).await;
        resolver.place_prediction(&id, "a", Side::Yes, 300).await.unwrap();
        resolver.place_prediction(&id, "b", Side::No, 300).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                let id = id.clone();
                tokio::spawn(async move { resolver.resolve(&id, Side::Yes).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, LedgerError::AlreadyResolved(_))),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(balance(&f.recorder, "a").await, 10_300);
    }

    #[tokio::test]
    async fn test_unfulfilled_market_refunds_everyone() {
        let f = fixture(UnfulfilledPolicy::Refund, &["a", "b"]).await;
        let id = active_scenario(&f.resolver).await;
        f.resolver.place_prediction(&id, "a", Side::No, 400).await.unwrap();
        f.resolver.place_prediction(&id, "b", Side::No, 250).await.unwrap();
        f.resolver.close(&id).await.unwrap();

        let resolution = f.resolver.resolve(&id, Side::Yes).await.unwrap();
        assert!(!resolution.was_fulfilled);
        assert!(resolution.payouts.iter().all(|p| !p.was_fulfilled));
        assert_eq!(balance(&f.recorder, "a").await, 10_000);
        assert_eq!(balance(&f.recorder, "b").await, 10_000);

        let predictions = f.store.predictions_for_scenario(&id).await.unwrap();
        assert!(predictions
            .iter()
            .all(|p| p.status == PredictionStatus::Refunded));
    }

    #[tokio::test]
    async fn test_unfulfilled_market_house_policy() {
        let f = fixture(UnfulfilledPolicy::HouseAbsorbs, &["a"]).await;
        let id = active_scenario(&f.resolver).await;
        f.resolver.place_prediction(&id, "a", Side::No, 400).await.unwrap();

        let resolution = f.resolver.resolve(&id, Side::Yes).await.unwrap();
        assert!(resolution.payouts.is_empty());
        assert_eq!(resolution.retained, 400);
        assert_eq!(balance(&f.recorder, "a").await, 9600);
    }

    #[tokio::test]
    async fn test_cancel_refunds_stakes() {
        let f = fixture(UnfulfilledPolicy::Refund, &["a", "b"]).await;
        let id = active_scenario(&f.resolver).await;
        f.resolver.place_prediction(&id, "a", Side::Yes, 100).await.unwrap();
        f.resolver.place_prediction(&id, "a", Side::No, 50).await.unwrap();
        f.resolver.place_prediction(&id, "b", Side::No, 70).await.unwrap();

        let resolution = f.resolver.cancel(&id).await.unwrap();
        assert_eq!(resolution.status, ScenarioStatus::Cancelled);
        assert_eq!(resolution.payouts.len(), 2);
        assert_eq!(balance(&f.recorder, "a").await, 10_000);
        assert_eq!(balance(&f.recorder, "b").await, 10_000);

        let err = f.resolver.resolve(&id, Side::Yes).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        let err = f.resolver.cancel(&id).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_predictions_rejected_unless_active() {
        let f = fixture(UnfulfilledPolicy::Refund, &["a"]).await;
        let scenario = f.resolver.create_scenario("Draft only", None).await.unwrap();

        let err = f
            .resolver
            .place_prediction(&scenario.id, "a", Side::Yes, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ValidationError(_)));

        f.resolver.open(&scenario.id).await.unwrap();
        let err = f
            .resolver
            .place_prediction(&scenario.id, "a", Side::Yes, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));

        let err = f
            .resolver
            .place_prediction(&scenario.id, "a", Side::Yes, 10_001)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(balance(&f.recorder, "a").await, 10_000);
    }

    #[tokio::test]
    async fn test_failed_prediction_insert_is_compensated() {
        let f = fixture(UnfulfilledPolicy::Refund, &["a"]).await;
        let id = active_scenario(&f.resolver).await;

        f.store.inject_fault(FaultPoint::InsertPrediction);
        let err = f
            .resolver
            .place_prediction(&id, "a", Side::Yes, 300)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InternalError(_)));

        assert_eq!(balance(&f.recorder, "a").await, 10_000);
        let kinds: Vec<_> = f.store.all_transactions().iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TransactionType::Bonus,
                TransactionType::PredictionBet,
                TransactionType::Refund
            ]
        );
        assert!(f.recorder.reconcile("a").await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_retry_completes_missing_payout_row() {
        let f = fixture(UnfulfilledPolicy::Refund, &["a", "b"]).await;
        let id = active_scenario(&f.resolver).await;
        f.resolver.place_prediction(&id, "a", Side::Yes, 100).await.unwrap();
        f.resolver.place_prediction(&id, "b", Side::No, 100).await.unwrap();

        f.store.inject_fault(FaultPoint::InsertPayout);
        let resolution = f.resolver.resolve(&id, Side::Yes).await.unwrap();
        assert!(resolution.payouts.is_empty());
        assert_eq!(resolution.unsettled, 1);
        assert_eq!(balance(&f.recorder, "a").await, 9900);

        let retried = f.resolver.retry_payouts(&id).await.unwrap();
        assert_eq!(retried.unsettled, 0);
        assert_eq!(retried.payouts.len(), 1);
        assert_eq!(retried.payouts[0].status, PayoutStatus::Completed);
        assert_eq!(balance(&f.recorder, "a").await, 10_100);

        // Nothing left to pay
        let entries = f.store.all_transactions().len();
        f.resolver.retry_payouts(&id).await.unwrap();
        assert_eq!(f.store.all_transactions().len(), entries);
    }

    #[tokio::test]
    async fn test_steal_moves_coins_through_ledger() {
        let f = fixture(UnfulfilledPolicy::Refund, &["thief", "victim"]).await;
        let id = active_scenario(&f.resolver).await;

        let outcome = f
            .resolver
            .steal(&id, "victim", "thief", 300, "round-1")
            .await
            .unwrap();
        assert_eq!(outcome.from_balance, 9700);
        assert_eq!(outcome.to_balance, 10_300);

        // Replay is a no-op
        f.resolver
            .steal(&id, "victim", "thief", 300, "round-1")
            .await
            .unwrap();
        assert_eq!(balance(&f.recorder, "victim").await, 9700);

        let err = f
            .resolver
            .steal(&id, "victim", "thief", 20_000, "round-2")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(balance(&f.recorder, "thief").await, 10_300);
    }

    #[tokio::test]
    async fn test_steal_credit_failure_is_compensated() {
        let f = fixture(UnfulfilledPolicy::Refund, &["victim"]).await;
        let id = active_scenario(&f.resolver).await;

        let err = f
            .resolver
            .steal(&id, "victim", "nobody", 300, "round-1")
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::AccountNotFound("nobody".into()));
        assert_eq!(balance(&f.recorder, "victim").await, 10_000);
        assert!(f.recorder.reconcile("victim").await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_steal_retry_after_compensation_mints_nothing() {
        let f = fixture(UnfulfilledPolicy::Refund, &["victim"]).await;
        let id = active_scenario(&f.resolver).await;

        f.resolver
            .steal(&id, "victim", "thief", 300, "round-1")
            .await
            .unwrap_err();
        f.recorder.open_account("thief", false).await.unwrap();

        let err = f
            .resolver
            .steal(&id, "victim", "thief", 300, "round-1")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ValidationError(_)));
        assert_eq!(balance(&f.recorder, "victim").await, 10_000);
        assert_eq!(balance(&f.recorder, "thief").await, 10_000);

        // A fresh ref goes through normally
        f.resolver
            .steal(&id, "victim", "thief", 300, "round-2")
            .await
            .unwrap();
        let total = balance(&f.recorder, "victim").await + balance(&f.recorder, "thief").await;
        assert_eq!(total, 20_000);
    }

    #[tokio::test]
    async fn test_lifecycle_is_forward_only() {
        let f = fixture(UnfulfilledPolicy::Refund, &[]).await;
        let scenario = f.resolver.create_scenario("Lifecycle", Some("creator")).await.unwrap();
        assert_eq!(scenario.status, ScenarioStatus::Draft);

        let err = f.resolver.close(&scenario.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        f.resolver.open(&scenario.id).await.unwrap();
        let closed = f.resolver.close(&scenario.id).await.unwrap();
        assert_eq!(closed.status, ScenarioStatus::Closed);

        let err = f.resolver.open(&scenario.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let err = f.resolver.get_scenario("missing").await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { kind: "scenario", .. }));
    }
}
