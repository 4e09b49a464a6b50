//! Gateway webhook pipeline
//!
//! verify signature → derive idempotency key → atomically claim → dispatch to
//! the lifecycle engine → record the outcome on the audit row.
//!
//! Dispatch returns a `Result`; the audit row is written on both arms before
//! the result is handed back, so a failed dispatch always leaves a `failed`
//! row and a non-2xx response for the provider to retry.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::lifecycle::{LifecycleEngine, RenewalReport};
use crate::models::{
    CardMetadata, PaymentKind, PaymentRecord, PaymentStatus, WebhookClaim, WebhookEvent,
    WebhookSource, WebhookStatus,
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Reason used when the gateway cancels a subscription without giving one
const GATEWAY_CANCELLED: &str = "gateway_cancelled";

const MAX_LIST_LIMIT: i64 = 500;

/// Hex HMAC-SHA256 of `payload` under `secret`
pub fn compute_signature(secret: &str, payload: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature against the raw body
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> BillingResult<()> {
    let provided =
        hex::decode(signature.trim()).map_err(|_| BillingError::WebhookSignatureInvalid)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(payload);
    mac.verify_slice(&provided)
        .map_err(|_| BillingError::WebhookSignatureInvalid)
}

// =============================================================================
// Wire payload
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayNotification {
    pub event_type: String,
    #[serde(default)]
    pub data: EventData,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventData {
    pub payment_key: Option<String>,
    pub billing_key: Option<String>,
    pub customer_key: Option<String>,
    pub order_id: Option<String>,
    pub subscription_id: Option<String>,
    pub status: Option<String>,
    pub amount: Option<i64>,
    pub total_amount: Option<i64>,
    pub reason: Option<String>,
    pub failure_reason: Option<String>,
    pub failure: Option<WireFailure>,
    pub card_company: Option<String>,
    pub card: Option<WireCard>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireFailure {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireCard {
    pub issuer_code: Option<String>,
    pub number: Option<String>,
    pub card_type: Option<String>,
}

impl EventData {
    fn subscription_uuid(&self) -> BillingResult<Option<Uuid>> {
        self.subscription_id
            .as_deref()
            .map(|raw| {
                Uuid::parse_str(raw)
                    .map_err(|_| BillingError::Validation(format!("invalid subscriptionId {}", raw)))
            })
            .transpose()
    }

    fn failure_text(&self) -> Option<String> {
        if let Some(reason) = &self.failure_reason {
            return Some(reason.clone());
        }
        self.failure.as_ref().map(|f| {
            format!(
                "{}: {}",
                f.code.as_deref().unwrap_or("UNKNOWN"),
                f.message.as_deref().unwrap_or_default()
            )
        })
    }

    fn renewal_report(&self) -> BillingResult<RenewalReport> {
        Ok(RenewalReport {
            order_id: self.order_id.clone(),
            payment_key: self.payment_key.clone(),
            subscription_id: self.subscription_uuid()?,
            amount: self.total_amount.or(self.amount),
            failure_reason: self.failure_text(),
        })
    }
}

/// Event type plus every gateway identifier plus the provider timestamp.
/// Falls back to a body digest when the provider sent no timestamp.
pub fn idempotency_key(notification: &GatewayNotification, raw_body: &[u8]) -> String {
    let data = &notification.data;
    let mut parts = vec![notification.event_type.clone()];
    for id in [
        &data.payment_key,
        &data.billing_key,
        &data.order_id,
        &data.subscription_id,
        &data.status,
    ]
    .into_iter()
    .flatten()
    {
        parts.push(id.clone());
    }
    match &notification.created_at {
        Some(ts) => parts.push(ts.clone()),
        None => parts.push(hex::encode(Sha256::digest(raw_body))),
    }
    parts.join(":")
}

// =============================================================================
// Pipeline
// =============================================================================

/// What happened to an accepted delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed { event_id: Uuid },
    /// Same key already processed successfully; acknowledged without effect
    Duplicate { event_id: Uuid },
    /// Unknown event type; acknowledged for forward compatibility
    Ignored { event_id: Uuid },
}

enum Dispatched {
    Handled,
    Ignored,
}

/// Result of a replay
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub event_id: Uuid,
    pub event_type: String,
    pub previous_status: WebhookStatus,
    pub previous_error: Option<String>,
    pub new_status: WebhookStatus,
    pub new_error: Option<String>,
    pub retry_count: u32,
    pub success: bool,
}

pub struct WebhookPipeline {
    engine: Arc<LifecycleEngine>,
    secret: String,
}

impl WebhookPipeline {
    pub fn new(engine: Arc<LifecycleEngine>, secret: impl Into<String>) -> Self {
        Self {
            engine,
            secret: secret.into(),
        }
    }

    /// Verify, deduplicate, dispatch and record one inbound delivery.
    ///
    /// Errors: `WebhookSignatureInvalid` (reject, nothing processed),
    /// `WebhookInProgress` (a live claim holds this key), `WebhookMalformed`
    /// (unparseable payload). Anything else is a dispatch failure the
    /// provider should retry.
    pub async fn handle(
        &self,
        source: WebhookSource,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        let now = self.engine.clock().now();
        let payload = String::from_utf8_lossy(raw_body).into_owned();

        let verified = match signature {
            Some(sig) => verify_signature(&self.secret, raw_body, sig),
            None => Err(BillingError::WebhookSignatureInvalid),
        };
        if let Err(e) = verified {
            tracing::warn!(source = %source, "Rejected webhook with invalid signature");
            self.record_rejected(source, "unverified", payload, signature, e.to_string())
                .await;
            return Err(e);
        }

        let notification: GatewayNotification = match serde_json::from_slice(raw_body) {
            Ok(n) => n,
            Err(e) => {
                let error = BillingError::WebhookMalformed(e.to_string());
                self.record_rejected(source, "malformed", payload, signature, error.to_string())
                    .await;
                return Err(error);
            }
        };

        let key = idempotency_key(&notification, raw_body);
        let candidate = WebhookEvent {
            id: Uuid::new_v4(),
            source,
            event_type: notification.event_type.clone(),
            idempotency_key: Some(key.clone()),
            payload,
            signature: signature.map(str::to_string),
            received_at: now,
            status: WebhookStatus::Processing,
            error_message: None,
            retry_count: 0,
            processing_started_at: Some(now),
        };

        let event = match self.engine.store().claim_webhook_event(&candidate, now).await? {
            WebhookClaim::Claimed(event) => event,
            WebhookClaim::AlreadyProcessed(existing) => {
                tracing::info!(
                    event_id = %existing.id,
                    event_type = %existing.event_type,
                    "Duplicate webhook delivery, already processed"
                );
                return Ok(WebhookOutcome::Duplicate {
                    event_id: existing.id,
                });
            }
            WebhookClaim::InProgress => {
                tracing::info!(
                    idempotency_key = %key,
                    "Duplicate webhook delivery while first is still processing"
                );
                return Err(BillingError::WebhookInProgress);
            }
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %source,
            retry_count = event.retry_count,
            "Processing gateway webhook"
        );

        let result = self.dispatch(source, &notification).await;
        self.record_outcome(&event, &result, event.retry_count).await;

        match result {
            Ok(Dispatched::Handled) => Ok(WebhookOutcome::Processed { event_id: event.id }),
            Ok(Dispatched::Ignored) => Ok(WebhookOutcome::Ignored { event_id: event.id }),
            Err(e) => Err(e),
        }
    }

    /// Audit an event that never became eligible for processing
    async fn record_rejected(
        &self,
        source: WebhookSource,
        event_type: &str,
        payload: String,
        signature: Option<&str>,
        error: String,
    ) {
        let event_type = serde_json::from_str::<serde_json::Value>(&payload)
            .ok()
            .and_then(|v| v.get("eventType").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or_else(|| event_type.to_string());

        let event = WebhookEvent {
            id: Uuid::new_v4(),
            source,
            event_type,
            idempotency_key: None,
            payload,
            signature: signature.map(str::to_string),
            received_at: self.engine.clock().now(),
            status: WebhookStatus::Failed,
            error_message: Some(error),
            retry_count: 0,
            processing_started_at: None,
        };

        if let Err(e) = self.engine.store().insert_webhook_event(&event).await {
            tracing::error!(error = %e, "Failed to record rejected webhook");
        }
    }

    /// Write the processing result; retried once, never propagated
    async fn record_outcome(
        &self,
        event: &WebhookEvent,
        result: &BillingResult<Dispatched>,
        retry_count: u32,
    ) {
        let (status, error_message) = match result {
            Ok(_) => (WebhookStatus::Success, None),
            Err(e) => (WebhookStatus::Failed, Some(e.to_string())),
        };

        let store = self.engine.store();
        if let Err(first) = store
            .finish_webhook_event(event.id, status, error_message.clone(), retry_count)
            .await
        {
            tracing::warn!(
                event_id = %event.id,
                error = %first,
                "Failed to record webhook outcome, retrying"
            );
            if let Err(retry_err) = store
                .finish_webhook_event(event.id, status, error_message.clone(), retry_count)
                .await
            {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    status = %status,
                    error_message = ?error_message,
                    first_error = %first,
                    retry_error = %retry_err,
                    "Webhook audit row left in processing state; it becomes reclaimable after the claim timeout"
                );
            }
        }

        if let Err(e) = result {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook dispatch failed"
            );
        }
    }

    async fn dispatch(
        &self,
        source: WebhookSource,
        notification: &GatewayNotification,
    ) -> BillingResult<Dispatched> {
        let data = &notification.data;

        match (source, notification.event_type.as_str()) {
            (WebhookSource::Subscription, "BILLING_KEY_CREATED") => {
                let customer = data.customer_key.as_deref().ok_or_else(|| {
                    BillingError::Validation("customerKey missing".to_string())
                })?;
                let token = data.billing_key.as_deref().ok_or_else(|| {
                    BillingError::Validation("billingKey missing".to_string())
                })?;
                let card = data.card.clone().unwrap_or_default();
                self.engine
                    .register_billing_key(
                        customer,
                        token,
                        CardMetadata {
                            issuer: data.card_company.clone().or(card.issuer_code),
                            number_masked: card.number,
                            card_type: card.card_type,
                        },
                    )
                    .await?;
            }
            (WebhookSource::Subscription, "BILLING_KEY_DELETED") => {
                let token = data.billing_key.as_deref().ok_or_else(|| {
                    BillingError::Validation("billingKey missing".to_string())
                })?;
                if self.engine.revoke_billing_key_by_token(token).await?.is_none() {
                    tracing::warn!("Deletion reported for an unknown billing key");
                }
            }
            (WebhookSource::Subscription, "SUBSCRIPTION_PAYMENT_SUCCESS") => {
                self.engine
                    .settle_renewal_success(&data.renewal_report()?)
                    .await?;
            }
            (WebhookSource::Subscription, "SUBSCRIPTION_PAYMENT_FAILED") => {
                self.engine
                    .settle_renewal_failure(&data.renewal_report()?)
                    .await?;
            }
            (WebhookSource::Subscription, "SUBSCRIPTION_CANCELLED") => {
                let id = data.subscription_uuid()?.ok_or_else(|| {
                    BillingError::Validation("subscriptionId missing".to_string())
                })?;
                let reason = data.reason.as_deref().unwrap_or(GATEWAY_CANCELLED);
                match self.engine.cancel(id, reason, true).await {
                    Ok(_) => {}
                    Err(BillingError::Conflict(msg)) => {
                        tracing::info!(subscription_id = %id, detail = %msg, "Already terminal");
                    }
                    Err(e) => return Err(e),
                }
            }
            (WebhookSource::Payment, "PAYMENT_STATUS_CHANGED") => {
                self.apply_payment_status(data).await?;
            }
            (_, other) => {
                tracing::info!(
                    event_type = %other,
                    source = %source,
                    "Unhandled webhook event type, acknowledging"
                );
                return Ok(Dispatched::Ignored);
            }
        }

        Ok(Dispatched::Handled)
    }

    async fn find_payment(&self, data: &EventData) -> BillingResult<Option<PaymentRecord>> {
        let store = self.engine.store();
        if let Some(order_id) = &data.order_id {
            if let Some(record) = store.get_payment_by_order(order_id).await? {
                return Ok(Some(record));
            }
        }
        if let Some(payment_key) = &data.payment_key {
            return store.get_payment_by_key(payment_key).await;
        }
        Ok(None)
    }

    async fn apply_payment_status(&self, data: &EventData) -> BillingResult<()> {
        let status = data
            .status
            .as_deref()
            .ok_or_else(|| BillingError::Validation("status missing".to_string()))?;

        let Some(mut record) = self.find_payment(data).await? else {
            tracing::warn!(
                order_id = ?data.order_id,
                payment_key = ?data.payment_key,
                "Status change for an unknown payment"
            );
            return Ok(());
        };

        let report = RenewalReport {
            order_id: Some(record.order_id.clone()),
            payment_key: data.payment_key.clone(),
            subscription_id: record.subscription_id,
            amount: None,
            failure_reason: data.failure_text().or_else(|| Some(format!("payment {}", status))),
        };

        let new_status = match status {
            "DONE" if record.kind == PaymentKind::Renewal => {
                self.engine.settle_renewal_success(&report).await?;
                return Ok(());
            }
            "ABORTED" | "EXPIRED" if record.kind == PaymentKind::Renewal => {
                self.engine.settle_renewal_failure(&report).await?;
                return Ok(());
            }
            "DONE" => PaymentStatus::Succeeded,
            "ABORTED" | "EXPIRED" => PaymentStatus::Failed,
            "CANCELED" => PaymentStatus::Cancelled,
            "PARTIAL_CANCELED" => PaymentStatus::PartiallyCancelled,
            other => {
                tracing::debug!(status = %other, "Intermediate payment status, nothing to apply");
                return Ok(());
            }
        };

        if record.status == new_status {
            return Ok(());
        }
        let observed = record.status;
        record.status = new_status;
        if record.payment_key.is_none() {
            record.payment_key = data.payment_key.clone();
        }
        record.updated_at = self.engine.clock().now();
        if !self
            .engine
            .store()
            .settle_payment(&record, observed)
            .await?
        {
            // Redelivery re-reads the record
            return Err(BillingError::ConcurrentModification(format!(
                "payment {}",
                record.order_id
            )));
        }

        tracing::info!(
            order_id = %record.order_id,
            status = %record.status,
            "Payment status updated from webhook"
        );
        Ok(())
    }

    // =========================================================================
    // Admin: audit reads and replay
    // =========================================================================

    pub async fn list_events(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEvent>> {
        self.engine
            .store()
            .list_webhook_events(status, limit.clamp(1, MAX_LIST_LIMIT), offset.max(0))
            .await
    }

    /// Re-run dispatch on a stored event's raw payload through the same
    /// claim as live delivery. A successfully processed event is not
    /// dispatched again.
    pub async fn replay_event(&self, id: Uuid) -> BillingResult<WebhookReplayResult> {
        let store = self.engine.store();
        let stored = store
            .get_webhook_event(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", id)))?;

        if stored.idempotency_key.is_none() {
            return Err(BillingError::Validation(
                "event was never verified and cannot be replayed".to_string(),
            ));
        }

        tracing::info!(event_id = %id, event_type = %stored.event_type, "Replaying webhook event");

        let now = self.engine.clock().now();
        let event = match store.claim_webhook_event(&stored, now).await? {
            WebhookClaim::Claimed(event) => event,
            WebhookClaim::AlreadyProcessed(event) => {
                return Ok(WebhookReplayResult {
                    event_id: event.id,
                    event_type: event.event_type,
                    previous_status: stored.status,
                    previous_error: stored.error_message,
                    new_status: WebhookStatus::Success,
                    new_error: None,
                    retry_count: event.retry_count,
                    success: true,
                });
            }
            WebhookClaim::InProgress => {
                return Err(BillingError::WebhookInProgress);
            }
        };

        let notification: GatewayNotification = serde_json::from_str(&event.payload)
            .map_err(|e| BillingError::Validation(format!("stored payload unreadable: {}", e)))?;
        let result = self.dispatch(event.source, &notification).await;
        self.record_outcome(&event, &result, event.retry_count).await;

        let new_error = result.as_ref().err().map(|e| e.to_string());
        tracing::info!(
            event_id = %id,
            previous_status = %stored.status,
            success = result.is_ok(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            event_id: event.id,
            event_type: event.event_type,
            previous_status: stored.status,
            previous_error: stored.error_message,
            new_status: if result.is_ok() {
                WebhookStatus::Success
            } else {
                WebhookStatus::Failed
            },
            new_error,
            retry_count: event.retry_count,
            success: result.is_ok(),
        })
    }

    /// Replay up to `max_events` failed, verified events
    pub async fn replay_failed(&self, max_events: i64) -> BillingResult<Vec<WebhookReplayResult>> {
        let failed = self
            .list_events(Some(WebhookStatus::Failed), max_events, 0)
            .await?;

        let mut results = Vec::with_capacity(failed.len());
        for event in failed.into_iter().filter(|e| e.idempotency_key.is_some()) {
            match self.replay_event(event.id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(event_id = %event.id, error = %e, "Failed to replay webhook");
                    results.push(WebhookReplayResult {
                        event_id: event.id,
                        event_type: event.event_type,
                        previous_status: event.status,
                        previous_error: event.error_message,
                        new_status: WebhookStatus::Failed,
                        new_error: Some(e.to_string()),
                        retry_count: event.retry_count,
                        success: false,
                    });
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::gateway::FakeGateway;
    use crate::lifecycle::CreateSubscription;
    use crate::models::{IntervalUnit, Plan, Subscription, SubscriptionStatus};
    use crate::store::{InMemoryLedger, LedgerStore};
    use time::macros::datetime;

    const SECRET: &str = "whsec_test";

    struct Setup {
        pipeline: WebhookPipeline,
        engine: Arc<LifecycleEngine>,
        store: Arc<InMemoryLedger>,
        clock: Arc<ManualClock>,
    }

    async fn setup() -> (Setup, Subscription) {
        let store = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(FakeGateway::new());
        let clock = Arc::new(ManualClock::new(datetime!(2026-01-15 10:00 UTC)));
        let engine = Arc::new(LifecycleEngine::new(store.clone(), gateway, clock.clone()));
        let plan = Plan {
            id: Uuid::new_v4(),
            name: "Pro monthly".to_string(),
            amount: 10_000,
            currency: "KRW".to_string(),
            interval_unit: IntervalUnit::Month,
            interval_count: 1,
            trial_days: 0,
            setup_fee: None,
            active: true,
            created_at: datetime!(2026-01-01 0:00 UTC),
        };
        store.put_plan(&plan).await.unwrap();
        let key = engine
            .register_billing_key("cust_1", "bk_1", CardMetadata::default())
            .await
            .unwrap();
        let sub = engine
            .create(CreateSubscription {
                customer_id: "cust_1".to_string(),
                plan_id: plan.id,
                billing_key_id: key.id,
                trial_days: None,
            })
            .await
            .unwrap()
            .subscription;

        let pipeline = WebhookPipeline::new(engine.clone(), SECRET);
        (
            Setup {
                pipeline,
                engine,
                store,
                clock,
            },
            sub,
        )
    }

    fn signed(body: &serde_json::Value) -> (Vec<u8>, String) {
        let raw = serde_json::to_vec(body).unwrap();
        let sig = compute_signature(SECRET, &raw).unwrap();
        (raw, sig)
    }

    #[test]
    fn test_signature_roundtrip_and_tamper() {
        let sig = compute_signature(SECRET, b"{\"a\":1}").unwrap();
        assert!(verify_signature(SECRET, b"{\"a\":1}", &sig).is_ok());
        assert!(verify_signature(SECRET, b"{\"a\":2}", &sig).is_err());
        assert!(verify_signature(SECRET, b"{\"a\":1}", "not-hex").is_err());
    }

    #[test]
    fn test_idempotency_key_uses_identifiers_and_timestamp() {
        let n: GatewayNotification = serde_json::from_value(serde_json::json!({
            "eventType": "SUBSCRIPTION_PAYMENT_SUCCESS",
            "data": {"paymentKey": "pay_1", "orderId": "ord_1"},
            "createdAt": "2026-02-15T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(
            idempotency_key(&n, b""),
            "SUBSCRIPTION_PAYMENT_SUCCESS:pay_1:ord_1:2026-02-15T10:00:00Z"
        );
    }

    #[tokio::test]
    async fn test_held_claim_malformed_body_and_dispatch_errors_are_distinct() {
        let (s, _sub) = setup().await;

        let raw = b"{\"eventType\":".to_vec();
        let sig = compute_signature(SECRET, &raw).unwrap();
        let err = s
            .pipeline
            .handle(WebhookSource::Payment, &raw, Some(&sig))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookMalformed(_)));

        // Token already owned by cust_1: the handler itself conflicts
        let body = serde_json::json!({
            "eventType": "BILLING_KEY_CREATED",
            "data": {"customerKey": "cust_2", "billingKey": "bk_1"},
            "createdAt": "2026-01-15T10:00:00Z"
        });
        let (raw, sig) = signed(&body);
        let err = s
            .pipeline
            .handle(WebhookSource::Subscription, &raw, Some(&sig))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        // A live claim on the key of a fresh event
        let body = serde_json::json!({
            "eventType": "BILLING_KEY_DELETED",
            "data": {"billingKey": "bk_1"},
            "createdAt": "2026-01-15T10:05:00Z"
        });
        let (raw, sig) = signed(&body);
        let notification: GatewayNotification = serde_json::from_slice(&raw).unwrap();
        let now = s.clock.now();
        let held = WebhookEvent {
            id: Uuid::new_v4(),
            source: WebhookSource::Subscription,
            event_type: notification.event_type.clone(),
            idempotency_key: Some(idempotency_key(&notification, &raw)),
            payload: String::from_utf8(raw.clone()).unwrap(),
            signature: Some(sig.clone()),
            received_at: now,
            status: WebhookStatus::Processing,
            error_message: None,
            retry_count: 0,
            processing_started_at: Some(now),
        };
        s.store.claim_webhook_event(&held, now).await.unwrap();

        let err = s
            .pipeline
            .handle(WebhookSource::Subscription, &raw, Some(&sig))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookInProgress));
    }

    #[tokio::test]
    async fn test_invalid_signature_recorded_without_mutation() {
        let (s, sub) = setup().await;
        let body = serde_json::json!({
            "eventType": "SUBSCRIPTION_CANCELLED",
            "data": {"subscriptionId": sub.id.to_string()},
            "createdAt": "2026-01-20T00:00:00Z"
        });
        let raw = serde_json::to_vec(&body).unwrap();

        let err = s
            .pipeline
            .handle(WebhookSource::Subscription, &raw, Some("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));

        let unchanged = s.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, SubscriptionStatus::Active);

        let events = s.pipeline.list_events(None, 10, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, WebhookStatus::Failed);
        assert_eq!(events[0].event_type, "SUBSCRIPTION_CANCELLED");
        assert!(events[0].idempotency_key.is_none());

        let err = s.pipeline.replay_event(events[0].id).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_replayed_payment_success_applied_once() {
        let (s, sub) = setup().await;
        s.clock.set(datetime!(2026-02-15 10:00 UTC));
        let body = serde_json::json!({
            "eventType": "SUBSCRIPTION_PAYMENT_SUCCESS",
            "data": {
                "subscriptionId": sub.id.to_string(),
                "paymentKey": "pay_ext_1",
                "amount": 10000
            },
            "createdAt": "2026-02-15T10:00:01Z"
        });
        let (raw, sig) = signed(&body);

        let first = s
            .pipeline
            .handle(WebhookSource::Subscription, &raw, Some(&sig))
            .await
            .unwrap();
        assert!(matches!(first, WebhookOutcome::Processed { .. }));

        let second = s
            .pipeline
            .handle(WebhookSource::Subscription, &raw, Some(&sig))
            .await
            .unwrap();
        assert!(matches!(second, WebhookOutcome::Duplicate { .. }));

        let after = s.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(after.total_payments, 1);
        assert_eq!(after.total_amount, 10_000);
        assert_eq!(after.next_billing_date, datetime!(2026-03-15 10:00 UTC));
        assert_eq!(s.pipeline.list_events(None, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_event_type_acknowledged() {
        let (s, _) = setup().await;
        let (raw, sig) = signed(&serde_json::json!({
            "eventType": "SOMETHING_NEW",
            "data": {},
            "createdAt": "2026-01-20T00:00:00Z"
        }));

        let outcome = s
            .pipeline
            .handle(WebhookSource::Subscription, &raw, Some(&sig))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
    }

    #[tokio::test]
    async fn test_failed_dispatch_recorded_and_replayable() {
        let (s, _) = setup().await;
        let missing = Uuid::new_v4();
        let (raw, sig) = signed(&serde_json::json!({
            "eventType": "SUBSCRIPTION_CANCELLED",
            "data": {"subscriptionId": missing.to_string()},
            "createdAt": "2026-01-20T00:00:00Z"
        }));

        let err = s
            .pipeline
            .handle(WebhookSource::Subscription, &raw, Some(&sig))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));

        let failed = s
            .pipeline
            .list_events(Some(WebhookStatus::Failed), 10, 0)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);

        let replay = s.pipeline.replay_event(failed[0].id).await.unwrap();
        assert!(!replay.success);
        assert_eq!(replay.retry_count, 1);
        let stored = s.store.get_webhook_event(failed[0].id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_failure_after_local_timeout_not_counted_twice() {
        let (s, sub) = setup().await;
        s.clock.set(datetime!(2026-02-15 10:00 UTC));

        // Local attempt recorded as failed (e.g. timed out)
        let applied_locally = {
            let candidate = PaymentRecord::new_pending(
                sub.renewal_order_id(),
                "cust_1".to_string(),
                Some(sub.id),
                PaymentKind::Renewal,
                10_000,
                "KRW".to_string(),
                Some(sub.next_billing_date),
                s.clock.now(),
            );
            s.store
                .claim_payment(&candidate, s.clock.now())
                .await
                .unwrap();
            s.engine.record_renewal_timeout(sub.id).await.unwrap()
        };
        assert_eq!(applied_locally.subscription.failed_payment_count, 1);

        let (raw, sig) = signed(&serde_json::json!({
            "eventType": "SUBSCRIPTION_PAYMENT_FAILED",
            "data": {"orderId": sub.renewal_order_id(), "failureReason": "card declined"},
            "createdAt": "2026-02-15T10:00:05Z"
        }));
        s.pipeline
            .handle(WebhookSource::Subscription, &raw, Some(&sig))
            .await
            .unwrap();

        let after = s.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(after.failed_payment_count, 1);
    }

    #[tokio::test]
    async fn test_success_accepted_after_local_timeout() {
        let (s, sub) = setup().await;
        s.clock.set(datetime!(2026-02-15 10:00 UTC));
        let candidate = PaymentRecord::new_pending(
            sub.renewal_order_id(),
            "cust_1".to_string(),
            Some(sub.id),
            PaymentKind::Renewal,
            10_000,
            "KRW".to_string(),
            Some(sub.next_billing_date),
            s.clock.now(),
        );
        s.store
            .claim_payment(&candidate, s.clock.now())
            .await
            .unwrap();
        s.engine.record_renewal_timeout(sub.id).await.unwrap();

        let (raw, sig) = signed(&serde_json::json!({
            "eventType": "PAYMENT_STATUS_CHANGED",
            "data": {"orderId": sub.renewal_order_id(), "paymentKey": "pay_late", "status": "DONE"},
            "createdAt": "2026-02-15T10:01:00Z"
        }));
        s.pipeline
            .handle(WebhookSource::Payment, &raw, Some(&sig))
            .await
            .unwrap();

        let after = s.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.failed_payment_count, 0);
        assert_eq!(after.total_payments, 1);
        let record = s
            .store
            .get_payment_by_order(&sub.renewal_order_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Succeeded);
        assert_eq!(record.payment_key.as_deref(), Some("pay_late"));
    }
}
