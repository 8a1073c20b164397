//! Route handlers. Thin: parse, call one component, wrap the result.

use axum::{
    extract::{Json as AxumJson, Path, Query, State as AxumState},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{success, ApiResult, AppState};
use crate::error::LedgerError;
use crate::ledger::{RecordRequest, TransactionType, TxReference};
use crate::market::Side;
use crate::rewards::RewardDefinition;
use crate::shop::ShopItem;

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn parse_side(raw: &str) -> Result<Side, LedgerError> {
    Side::from_str(raw)
        .ok_or_else(|| LedgerError::ValidationError(format!("result must be YES or NO, got {raw:?}")))
}

// ---- wallet ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAccountRequest {
    pub account_id: String,
    #[serde(default)]
    pub has_unlimited_balance: bool,
}

pub async fn open_account(
    AxumState(state): AxumState<AppState>,
    AxumJson(req): AxumJson<OpenAccountRequest>,
) -> ApiResult {
    let stats = state
        .recorder
        .open_account(&req.account_id, req.has_unlimited_balance)
        .await?;
    success(stats)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordTransactionRequest {
    pub account_id: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: i64,
    #[serde(default)]
    pub description: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub metadata: Option<Value>,
}

pub async fn record_transaction(
    AxumState(state): AxumState<AppState>,
    AxumJson(req): AxumJson<RecordTransactionRequest>,
) -> ApiResult {
    let reference = match (req.reference_type.as_deref(), req.reference_id.as_deref()) {
        (Some(t), Some(id)) => Some(TxReference::new(t, id)),
        (None, None) => None,
        _ => {
            return Err(LedgerError::ValidationError(
                "referenceType and referenceId must be given together".to_string(),
            )
            .into())
        }
    };

    let mut record = RecordRequest::new(&req.account_id, req.kind, req.amount, &req.description);
    record.reference = reference;
    record.metadata = req.metadata;
    let outcome = state.recorder.record(record).await?;
    success(outcome)
}

pub async fn wallet_stats(
    AxumState(state): AxumState<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult {
    success(state.recorder.wallet_stats(&account_id).await?)
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn wallet_transactions(
    AxumState(state): AxumState<AppState>,
    Path(account_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    let transactions = state.recorder.history(&account_id, query.limit).await?;
    success(json!({ "transactions": transactions }))
}

pub async fn wallet_reconcile(
    AxumState(state): AxumState<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult {
    success(state.recorder.reconcile(&account_id).await?)
}

// ---- markets ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScenarioRequest {
    pub title: String,
    pub creator_id: Option<String>,
}

pub async fn create_scenario(
    AxumState(state): AxumState<AppState>,
    AxumJson(req): AxumJson<CreateScenarioRequest>,
) -> ApiResult {
    let scenario = state
        .resolver
        .create_scenario(&req.title, req.creator_id.as_deref())
        .await?;
    success(json!({ "scenario": scenario }))
}

pub async fn get_scenario(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let scenario = state.resolver.get_scenario(&id).await?;
    success(json!({ "scenario": scenario }))
}

pub async fn open_scenario(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let scenario = state.resolver.open(&id).await?;
    success(json!({ "scenario": scenario }))
}

pub async fn close_scenario(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let scenario = state.resolver.close(&id).await?;
    success(json!({ "scenario": scenario }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacePredictionRequest {
    pub user_id: String,
    pub side: String,
    pub amount: i64,
}

pub async fn place_prediction(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    AxumJson(req): AxumJson<PlacePredictionRequest>,
) -> ApiResult {
    let side = parse_side(&req.side)?;
    let placed = state
        .resolver
        .place_prediction(&id, &req.user_id, side, req.amount)
        .await?;
    success(placed)
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub result: String,
}

pub async fn resolve_scenario(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    AxumJson(req): AxumJson<ResolveRequest>,
) -> ApiResult {
    let result = parse_side(&req.result)?;
    success(state.resolver.resolve(&id, result).await?)
}

pub async fn cancel_scenario(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    success(state.resolver.cancel(&id).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StealRequest {
    pub from_user_id: String,
    pub to_user_id: String,
    pub amount: i64,
    pub steal_ref: String,
}

pub async fn steal(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    AxumJson(req): AxumJson<StealRequest>,
) -> ApiResult {
    let outcome = state
        .resolver
        .steal(&id, &req.from_user_id, &req.to_user_id, req.amount, &req.steal_ref)
        .await?;
    success(outcome)
}

pub async fn scenario_payouts(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let payouts = state.resolver.payouts(&id).await?;
    success(json!({ "payouts": payouts }))
}

pub async fn retry_payouts(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    success(state.resolver.retry_payouts(&id).await?)
}

// ---- shop ----

pub async fn upsert_item(
    AxumState(state): AxumState<AppState>,
    AxumJson(item): AxumJson<ShopItem>,
) -> ApiResult {
    let item = state.shop.upsert_item(item).await?;
    success(json!({ "item": item }))
}

pub async fn get_item(
    AxumState(state): AxumState<AppState>,
    Path(item_id): Path<String>,
) -> ApiResult {
    let item = state.shop.get_item(&item_id).await?;
    success(json!({ "item": item }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub account_id: String,
    pub item_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    pub request_id: Option<String>,
}

fn default_quantity() -> i64 {
    1
}

pub async fn purchase_item(
    AxumState(state): AxumState<AppState>,
    AxumJson(req): AxumJson<PurchaseRequest>,
) -> ApiResult {
    let receipt = state
        .shop
        .purchase(
            &req.account_id,
            &req.item_id,
            req.quantity,
            req.request_id.as_deref(),
        )
        .await?;
    success(receipt)
}

pub async fn inventory(
    AxumState(state): AxumState<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult {
    let inventory = state.shop.inventory(&account_id).await?;
    success(json!({ "inventory": inventory }))
}

// ---- rewards ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRewardRequest {
    pub account_id: String,
    #[serde(flatten)]
    pub definition: RewardDefinition,
}

pub async fn register_reward(
    AxumState(state): AxumState<AppState>,
    AxumJson(req): AxumJson<RegisterRewardRequest>,
) -> ApiResult {
    let reward = state.rewards.register(&req.account_id, req.definition).await?;
    success(json!({ "reward": reward }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceRewardRequest {
    pub account_id: String,
    pub reward_ref: String,
    #[serde(default = "default_quantity")]
    pub delta: i64,
}

pub async fn advance_reward(
    AxumState(state): AxumState<AppState>,
    AxumJson(req): AxumJson<AdvanceRewardRequest>,
) -> ApiResult {
    let reward = state
        .rewards
        .advance(&req.account_id, &req.reward_ref, req.delta)
        .await?;
    success(json!({ "reward": reward }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub account_id: String,
    pub reward_ref: String,
}

pub async fn claim_reward(
    AxumState(state): AxumState<AppState>,
    AxumJson(req): AxumJson<ClaimRequest>,
) -> ApiResult {
    success(state.rewards.claim(&req.account_id, &req.reward_ref).await?)
}

pub async fn user_progress(
    AxumState(state): AxumState<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult {
    success(state.rewards.progress(&account_id).await?)
}
