//! Operator routes: webhook audit, replay and settlement lookup

use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use subledger_billing::{SettlementRecord, WebhookEvent, WebhookReplayResult, WebhookStatus};
use time::{macros::format_description, Date, Duration};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SettlementsQuery {
    pub date: String,
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<Vec<WebhookEvent>>> {
    let status = query
        .status
        .as_deref()
        .map(WebhookStatus::from_str)
        .transpose()
        .map_err(|_| {
            ApiError::Validation("status must be processing, success or failed".to_string())
        })?;

    let events = state
        .billing
        .webhooks
        .list_events(status, query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(events))
}

pub async fn retry_webhook(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WebhookReplayResult>> {
    tracing::info!(
        event_id = %id,
        admin = %auth_user.actor.customer_id,
        "Admin webhook replay requested"
    );
    let result = state.billing.webhooks.replay_event(id).await?;
    Ok(Json(result))
}

pub async fn list_settlements(
    State(state): State<AppState>,
    Query(query): Query<SettlementsQuery>,
) -> ApiResult<Json<Vec<SettlementRecord>>> {
    let date = Date::parse(&query.date, format_description!("[year]-[month]-[day]"))
        .map_err(|_| ApiError::Validation("date must be YYYY-MM-DD".to_string()))?;
    let from = date.midnight().assume_utc();
    let to = from + Duration::days(1);

    let settlements = state
        .billing
        .operations
        .settlements_between(from, to)
        .await?;
    Ok(Json(settlements))
}
