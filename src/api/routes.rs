use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::config::LedgerSettings;
use crate::events::EventBus;
use crate::ledger::{LedgerStore, TransactionRecorder};
use crate::market::MarketResolver;
use crate::middleware::request_logging;
use crate::rewards::RewardIssuer;
use crate::shop::PurchaseProcessor;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub recorder: Arc<TransactionRecorder>,
    pub resolver: Arc<MarketResolver>,
    pub shop: Arc<PurchaseProcessor>,
    pub rewards: Arc<RewardIssuer>,
    pub events: EventBus,
}

impl AppState {
    /// Wire every component onto one store.
    pub fn new(store: Arc<dyn LedgerStore>, settings: &LedgerSettings) -> Self {
        let events = EventBus::new(settings.event_capacity);
        let recorder = Arc::new(
            TransactionRecorder::new(store)
                .with_welcome_bonus(settings.welcome_bonus)
                .with_history_limit(settings.history_limit),
        );
        let resolver = Arc::new(
            MarketResolver::new(recorder.clone(), events.clone())
                .with_policy(settings.unfulfilled_policy)
                .with_max_concurrency(settings.max_payout_concurrency),
        );

        Self {
            shop: Arc::new(PurchaseProcessor::new(recorder.clone())),
            rewards: Arc::new(RewardIssuer::new(recorder.clone())),
            recorder,
            resolver,
            events,
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // wallet
        .route("/api/accounts", post(handlers::open_account))
        .route("/api/transactions", post(handlers::record_transaction))
        .route("/api/wallet/:account_id/stats", get(handlers::wallet_stats))
        .route(
            "/api/wallet/:account_id/transactions",
            get(handlers::wallet_transactions),
        )
        .route(
            "/api/wallet/:account_id/reconcile",
            get(handlers::wallet_reconcile),
        )
        // markets
        .route("/api/scenarios", post(handlers::create_scenario))
        .route("/api/scenarios/:id", get(handlers::get_scenario))
        .route("/api/scenarios/:id/open", post(handlers::open_scenario))
        .route("/api/scenarios/:id/close", post(handlers::close_scenario))
        .route(
            "/api/scenarios/:id/predictions",
            post(handlers::place_prediction),
        )
        .route("/api/scenarios/:id/resolve", post(handlers::resolve_scenario))
        .route("/api/scenarios/:id/cancel", post(handlers::cancel_scenario))
        .route("/api/scenarios/:id/steal", post(handlers::steal))
        .route("/api/scenarios/:id/payouts", get(handlers::scenario_payouts))
        .route(
            "/api/scenarios/:id/payouts/retry",
            post(handlers::retry_payouts),
        )
        // shop
        .route("/api/shop/items", post(handlers::upsert_item))
        .route("/api/shop/items/:item_id", get(handlers::get_item))
        .route("/api/shop/purchase", post(handlers::purchase_item))
        .route(
            "/api/shop/inventory/:account_id",
            get(handlers::inventory),
        )
        // rewards
        .route("/api/rewards", post(handlers::register_reward))
        .route("/api/rewards/progress", post(handlers::advance_reward))
        .route("/api/rewards/claim", post(handlers::claim_reward))
        .route(
            "/api/rewards/:account_id/progress",
            get(handlers::user_progress),
        )
        .layer(middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
