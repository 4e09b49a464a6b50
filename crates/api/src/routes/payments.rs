//! One-shot payment operations

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use subledger_billing::{CashReceipt, CashReceiptType, EscrowConfirmation, PartialCancelResult};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialCancelRequest {
    pub cancel_amount: i64,
    pub cancel_reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashReceiptRequest {
    pub receipt_type: CashReceiptType,
    pub identity_number: String,
}

pub async fn partial_cancel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(payment_key): Path<String>,
    Json(req): Json<PartialCancelRequest>,
) -> ApiResult<Json<PartialCancelResult>> {
    let result = state
        .billing
        .operations
        .partial_cancel(
            &auth_user.actor,
            &payment_key,
            req.cancel_amount,
            &req.cancel_reason,
        )
        .await?;
    Ok(Json(result))
}

pub async fn confirm_escrow(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(payment_key): Path<String>,
) -> ApiResult<Json<EscrowConfirmation>> {
    let confirmation = state
        .billing
        .operations
        .confirm_escrow(&auth_user.actor, &payment_key)
        .await?;
    Ok(Json(confirmation))
}

pub async fn issue_cash_receipt(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(payment_key): Path<String>,
    Json(req): Json<CashReceiptRequest>,
) -> ApiResult<Json<CashReceipt>> {
    let receipt = state
        .billing
        .operations
        .issue_cash_receipt(
            &auth_user.actor,
            &payment_key,
            req.receipt_type,
            &req.identity_number,
        )
        .await?;
    Ok(Json(receipt))
}
