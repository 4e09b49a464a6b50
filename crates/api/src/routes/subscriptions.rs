//! Subscriber-facing subscription and billing key routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use subledger_billing::{CreateSubscription, CreatedSubscription, RevokedBillingKey, Subscription};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub plan_id: Uuid,
    /// Previously registered key
    pub billing_key_id: Option<Uuid>,
    /// Card authorization to exchange for a new key
    pub auth_key: Option<String>,
    pub trial_days: Option<u32>,
    /// Admins may create on behalf of a customer
    pub customer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub reason: Option<String>,
    #[serde(default)]
    pub immediate: bool,
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<CreatedSubscription>)> {
    let customer_id = match req.customer_id {
        Some(ref id) if id != &auth_user.actor.customer_id => {
            auth_user.actor.ensure_can_access(id)?;
            id.clone()
        }
        _ => auth_user.actor.customer_id.clone(),
    };

    let engine = &state.billing.engine;
    let billing_key_id = match (req.billing_key_id, req.auth_key.as_deref()) {
        (Some(id), None) => id,
        (None, Some(auth_key)) => engine.issue_billing_key(&customer_id, auth_key).await?.id,
        _ => {
            return Err(ApiError::Validation(
                "exactly one of billingKeyId or authKey is required".to_string(),
            ))
        }
    };

    let created = engine
        .create(CreateSubscription {
            customer_id,
            plan_id: req.plan_id,
            billing_key_id,
            trial_days: req.trial_days,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Subscription>>> {
    let subscriptions = state
        .billing
        .engine
        .list_customer_subscriptions(&auth_user.actor)
        .await?;
    Ok(Json(subscriptions))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .engine
        .get_subscription(&auth_user.actor, id)
        .await?;
    Ok(Json(subscription))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<Subscription>> {
    let engine = &state.billing.engine;
    engine.get_subscription(&auth_user.actor, id).await?;

    let reason = req
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("customer_request");
    let subscription = engine.cancel(id, reason, req.immediate).await?;
    Ok(Json(subscription))
}

pub async fn pause_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let engine = &state.billing.engine;
    engine.get_subscription(&auth_user.actor, id).await?;
    Ok(Json(engine.pause(id).await?))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let engine = &state.billing.engine;
    engine.get_subscription(&auth_user.actor, id).await?;
    Ok(Json(engine.resume(id).await?))
}

pub async fn revoke_billing_key(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RevokedBillingKey>> {
    let engine = &state.billing.engine;
    engine.get_billing_key(&auth_user.actor, id).await?;
    Ok(Json(engine.revoke_billing_key(id).await?))
}
