//! Settlement math
//!
//! Pure functions from a scenario's stakes to the credits owed. Payouts are
//! proportional pool shares, `floor(stake * pool / winning_stake_total)`,
//! computed per recipient after summing that recipient's winning stakes.
//! The rounding remainder stays with the pool and is reported as `retained`.
//!
//! A plan depends only on the stakes and the result, never on the stakes'
//! current status, so re-running it for a retry yields the same credits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{LedgerError, LedgerResult};
use crate::market::scenario::{Prediction, PredictionStatus, Side};

/// What happens to the pool when nobody backed the winning side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnfulfilledPolicy {
    /// Every stake is returned
    #[default]
    Refund,
    /// Stakes are forfeited to the house; no payout rows
    #[serde(rename = "house")]
    HouseAbsorbs,
}

impl UnfulfilledPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "refund" => Some(UnfulfilledPolicy::Refund),
            "house" => Some(UnfulfilledPolicy::HouseAbsorbs),
            _ => None,
        }
    }
}

/// One credit owed to one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutLine {
    pub recipient_id: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementPlan {
    pub pool_total: i64,
    pub winning_stake_total: i64,
    pub was_fulfilled: bool,
    /// Sorted by recipient id
    pub payouts: Vec<PayoutLine>,
    /// `(prediction_id, final status)` for every stake
    pub outcomes: Vec<(String, PredictionStatus)>,
    pub retained: i64,
}

/// `floor(stake * pool / winning_total)` without intermediate overflow.
pub fn proportional_share(stake: i64, winning_total: i64, pool_total: i64) -> i64 {
    if stake <= 0 || winning_total <= 0 || pool_total <= 0 {
        return 0;
    }
    let share = (stake as u128 * pool_total as u128) / winning_total as u128;
    share as i64
}

/// Sum of all stakes. Fails with `InvalidAmount` when it does not fit in an
/// i64; unlimited accounts can stake without bound.
fn pool_total(predictions: &[Prediction]) -> LedgerResult<i64> {
    predictions.iter().try_fold(0i64, |acc, p| {
        acc.checked_add(p.amount).ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "scenario {} pool exceeds the representable total",
                p.scenario_id
            ))
        })
    })
}

/// Split the pool among the winning side.
///
/// Stakes are positive, so once the pool total fits every partial sum
/// (winning side, per-recipient) fits as well.
pub fn settle(
    predictions: &[Prediction],
    result: Side,
    policy: UnfulfilledPolicy,
) -> LedgerResult<SettlementPlan> {
    let pool_total = pool_total(predictions)?;
    let winning_stake_total: i64 = predictions
        .iter()
        .filter(|p| p.side == result)
        .map(|p| p.amount)
        .sum();

    if winning_stake_total == 0 {
        return match policy {
            UnfulfilledPolicy::Refund => refund_all(predictions),
            UnfulfilledPolicy::HouseAbsorbs => Ok(SettlementPlan {
                pool_total,
                winning_stake_total: 0,
                was_fulfilled: false,
                payouts: Vec::new(),
                outcomes: predictions
                    .iter()
                    .map(|p| (p.id.clone(), PredictionStatus::Lost))
                    .collect(),
                retained: pool_total,
            }),
        };
    }

    let mut stakes: BTreeMap<&str, i64> = BTreeMap::new();
    let mut outcomes = Vec::with_capacity(predictions.len());
    for p in predictions {
        if p.side == result {
            *stakes.entry(p.user_id.as_str()).or_default() += p.amount;
            outcomes.push((p.id.clone(), PredictionStatus::Won));
        } else {
            outcomes.push((p.id.clone(), PredictionStatus::Lost));
        }
    }

    let payouts: Vec<PayoutLine> = stakes
        .into_iter()
        .map(|(recipient, stake)| PayoutLine {
            recipient_id: recipient.to_string(),
            amount: proportional_share(stake, winning_stake_total, pool_total),
        })
        .collect();
    let paid: i64 = payouts.iter().map(|p| p.amount).sum();

    Ok(SettlementPlan {
        pool_total,
        winning_stake_total,
        was_fulfilled: true,
        payouts,
        outcomes,
        retained: pool_total - paid,
    })
}

/// Return every stake to its owner. Used for unfulfilled markets under the
/// refund policy and for cancellation.
pub fn refund_all(predictions: &[Prediction]) -> LedgerResult<SettlementPlan> {
    let pool_total = pool_total(predictions)?;
    let mut stakes: BTreeMap<&str, i64> = BTreeMap::new();
    let mut outcomes = Vec::with_capacity(predictions.len());
    for p in predictions {
        *stakes.entry(p.user_id.as_str()).or_default() += p.amount;
        outcomes.push((p.id.clone(), PredictionStatus::Refunded));
    }

    Ok(SettlementPlan {
        pool_total,
        winning_stake_total: 0,
        was_fulfilled: false,
        payouts: stakes
            .into_iter()
            .map(|(recipient, stake)| PayoutLine {
                recipient_id: recipient.to_string(),
                amount: stake,
            })
            .collect(),
        outcomes,
        retained: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stake(id: &str, user: &str, side: Side, amount: i64) -> Prediction {
        Prediction {
            id: id.to_string(),
            scenario_id: "s1".to_string(),
            user_id: user.to_string(),
            side,
            amount,
            status: PredictionStatus::Pending,
            created_at: 0,
        }
    }

    fn payout_for(plan: &SettlementPlan, user: &str) -> Option<i64> {
        plan.payouts
            .iter()
            .find(|p| p.recipient_id == user)
            .map(|p| p.amount)
    }

    #[test]
    fn test_proportional_share_example() {
        assert_eq!(proportional_share(500, 2500, 10_000), 2000);

        let predictions = vec![
            stake("p1", "crowd", Side::Yes, 7500),
            stake("p2", "early", Side::No, 2000),
            stake("p3", "user", Side::No, 500),
        ];
        let plan = settle(&predictions, Side::No, UnfulfilledPolicy::Refund).unwrap();

        assert_eq!(plan.pool_total, 10_000);
        assert_eq!(plan.winning_stake_total, 2500);
        assert!(plan.was_fulfilled);
        assert_eq!(payout_for(&plan, "user"), Some(2000));
        assert_eq!(payout_for(&plan, "early"), Some(8000));
        assert_eq!(payout_for(&plan, "crowd"), None);
        assert_eq!(plan.retained, 0);
        assert!(plan
            .outcomes
            .contains(&("p1".to_string(), PredictionStatus::Lost)));
    }

    #[test]
    fn test_rounding_down_retains_remainder() {
        let predictions = vec![
            stake("p1", "a", Side::Yes, 1),
            stake("p2", "b", Side::Yes, 1),
            stake("p3", "c", Side::Yes, 1),
            stake("p4", "d", Side::No, 7),
        ];
        let plan = settle(&predictions, Side::Yes, UnfulfilledPolicy::Refund).unwrap();

        // 10 / 3 each, floored
        assert_eq!(payout_for(&plan, "a"), Some(3));
        assert_eq!(payout_for(&plan, "b"), Some(3));
        assert_eq!(payout_for(&plan, "c"), Some(3));
        assert_eq!(plan.retained, 1);
        let paid: i64 = plan.payouts.iter().map(|p| p.amount).sum();
        assert!(paid <= plan.pool_total);
    }

    #[test]
    fn test_stakes_aggregate_per_recipient() {
        let predictions = vec![
            stake("p1", "a", Side::Yes, 1),
            stake("p2", "a", Side::Yes, 1),
            stake("p3", "b", Side::Yes, 1),
            stake("p4", "c", Side::No, 2),
        ];
        let plan = settle(&predictions, Side::Yes, UnfulfilledPolicy::Refund).unwrap();

        assert_eq!(plan.payouts.len(), 2);
        // 2 * 5 / 3 = 3, 1 * 5 / 3 = 1
        assert_eq!(payout_for(&plan, "a"), Some(3));
        assert_eq!(payout_for(&plan, "b"), Some(1));
        assert_eq!(plan.retained, 1);
    }

    #[test]
    fn test_unfulfilled_refund_policy() {
        let predictions = vec![
            stake("p1", "a", Side::No, 300),
            stake("p2", "b", Side::No, 200),
            stake("p3", "a", Side::No, 100),
        ];
        let plan = settle(&predictions, Side::Yes, UnfulfilledPolicy::Refund).unwrap();

        assert!(!plan.was_fulfilled);
        assert_eq!(payout_for(&plan, "a"), Some(400));
        assert_eq!(payout_for(&plan, "b"), Some(200));
        assert_eq!(plan.retained, 0);
        assert!(plan
            .outcomes
            .iter()
            .all(|(_, s)| *s == PredictionStatus::Refunded));
    }

    #[test]
    fn test_unfulfilled_house_policy() {
        let predictions = vec![stake("p1", "a", Side::No, 300)];
        let plan = settle(&predictions, Side::Yes, UnfulfilledPolicy::HouseAbsorbs).unwrap();

        assert!(!plan.was_fulfilled);
        assert!(plan.payouts.is_empty());
        assert_eq!(plan.retained, 300);
        assert_eq!(plan.outcomes, vec![("p1".to_string(), PredictionStatus::Lost)]);
    }

    #[test]
    fn test_plan_ignores_current_status() {
        let mut predictions = vec![
            stake("p1", "a", Side::Yes, 500),
            stake("p2", "b", Side::No, 100),
        ];
        let first = settle(&predictions, Side::Yes, UnfulfilledPolicy::Refund).unwrap();

        predictions[0].status = PredictionStatus::Won;
        predictions[1].status = PredictionStatus::Lost;
        let again = settle(&predictions, Side::Yes, UnfulfilledPolicy::Refund).unwrap();

        assert_eq!(first, again);
        assert_eq!(payout_for(&again, "a"), Some(600));
    }

    #[test]
    fn test_no_overflow_on_large_pools() {
        let big = i64::MAX / 4;
        assert_eq!(proportional_share(big, big, big), big);
        assert_eq!(proportional_share(1, 3, big * 3), big);
    }

    #[test]
    fn test_pool_overflow_is_rejected() {
        let predictions = vec![
            stake("p1", "staff", Side::Yes, i64::MAX),
            stake("p2", "a", Side::No, 1),
        ];

        let err = settle(&predictions, Side::Yes, UnfulfilledPolicy::Refund).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        let err = refund_all(&predictions).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));

        let fits = vec![stake("p1", "staff", Side::Yes, i64::MAX - 1), stake("p2", "a", Side::No, 1)];
        let plan = settle(&fits, Side::Yes, UnfulfilledPolicy::Refund).unwrap();
        assert_eq!(plan.pool_total, i64::MAX);
        assert_eq!(payout_for(&plan, "staff"), Some(i64::MAX));
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(UnfulfilledPolicy::from_str("Refund"), Some(UnfulfilledPolicy::Refund));
        assert_eq!(UnfulfilledPolicy::from_str("house"), Some(UnfulfilledPolicy::HouseAbsorbs));
        assert_eq!(UnfulfilledPolicy::from_str("burn"), None);
        assert_eq!(
            serde_json::to_string(&UnfulfilledPolicy::HouseAbsorbs).unwrap(),
            "\"house\""
        );
    }
}
