//! Settlement events
//!
//! Resolution and cancellation publish their result here once the ledger
//! work is done. Consumers (notification fan-out, audit sinks) subscribe
//! independently; a slow consumer lags, it never blocks settlement.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::market::scenario::Side;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SettlementEvent {
    ScenarioResolved {
        scenario_id: String,
        result: Side,
        pool_total: i64,
        winning_stake_total: i64,
        was_fulfilled: bool,
        recipients: usize,
        retained: i64,
    },
    ScenarioCancelled {
        scenario_id: String,
        refunded: usize,
    },
    PayoutFailed {
        scenario_id: String,
        recipient_id: String,
        error: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SettlementEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: SettlementEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Log every settlement event until the bus is dropped.
pub fn spawn_event_logger(mut rx: broadcast::Receiver<SettlementEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SettlementEvent::ScenarioResolved {
                    scenario_id,
                    result,
                    pool_total,
                    recipients,
                    retained,
                    was_fulfilled,
                    ..
                }) => {
                    info!(
                        %scenario_id,
                        result = result.as_str(),
                        pool_total,
                        recipients,
                        retained,
                        was_fulfilled,
                        "Scenario resolved"
                    );
                }
                Ok(SettlementEvent::ScenarioCancelled {
                    scenario_id,
                    refunded,
                }) => {
                    info!(%scenario_id, refunded, "Scenario cancelled");
                }
                Ok(SettlementEvent::PayoutFailed {
                    scenario_id,
                    recipient_id,
                    error,
                }) => {
                    warn!(%scenario_id, %recipient_id, %error, "Payout failed; retry pending");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Settlement event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
