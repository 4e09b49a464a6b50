//! Gateway webhook endpoints
//!
//! Signatures are checked over the raw body, so these handlers take `Bytes`
//! rather than a JSON extractor.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subledger_billing::{BillingError, WebhookSource, SIGNATURE_HEADER};

use crate::state::AppState;

pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(&state, WebhookSource::Payment, &headers, &body).await
}

pub async fn subscription_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(&state, WebhookSource::Subscription, &headers, &body).await
}

async fn handle(
    state: &AppState,
    source: WebhookSource,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match state.billing.webhooks.handle(source, body, signature).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => {
            let (status, message) = match &err {
                BillingError::WebhookSignatureInvalid => {
                    (StatusCode::FORBIDDEN, "Invalid signature")
                }
                BillingError::WebhookInProgress => {
                    (StatusCode::CONFLICT, "Event is being processed")
                }
                BillingError::WebhookMalformed(_) => (StatusCode::BAD_REQUEST, "Malformed payload"),
                // Handler failures included; non-2xx so the provider redelivers
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "Webhook processing failed"),
            };
            if status.is_server_error() {
                tracing::error!(source = %source, error = %err, "Webhook processing failed");
            } else {
                tracing::warn!(source = %source, error = %err, "Webhook rejected");
            }

            (
                status,
                Json(json!({
                    "error": message,
                    "code": status.as_u16()
                })),
            )
                .into_response()
        }
    }
}
