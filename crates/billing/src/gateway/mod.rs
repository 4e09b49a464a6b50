//! Payment gateway adapter
//!
//! `PaymentGateway` is the contract the lifecycle engine and the one-shot
//! operations charge through. `HttpGateway` speaks the provider's JSON API;
//! `FakeGateway` is a scriptable stand-in for tests.

mod client;
#[cfg(any(test, feature = "test-util"))]
mod fake;

pub use client::{GatewayConfig, HttpGateway};
#[cfg(any(test, feature = "test-util"))]
pub use fake::{FakeGateway, GatewayCall};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BillingResult;
use crate::models::{CardMetadata, CashReceiptType};

/// Charge a stored billing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub billing_key: String,
    pub customer_key: String,
    pub amount: i64,
    pub order_id: String,
    pub order_name: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub payment_key: String,
    pub order_id: String,
    pub status: String,
    pub total_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueBillingKeyRequest {
    pub auth_key: String,
    pub customer_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedBillingKey {
    pub billing_key: String,
    pub customer_key: String,
    pub card: CardMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelPaymentRequest {
    pub payment_key: String,
    pub cancel_reason: String,
    /// `None` cancels the remaining balance
    pub cancel_amount: Option<i64>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReceipt {
    pub payment_key: String,
    pub status: String,
    pub transaction_key: Option<String>,
    pub cancel_amount: i64,
    pub balance_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowReceipt {
    pub payment_key: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashReceiptRequest {
    pub payment_key: String,
    pub order_id: String,
    pub order_name: String,
    pub amount: i64,
    pub receipt_type: CashReceiptType,
    pub identity_number: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCashReceipt {
    pub receipt_key: String,
    pub receipt_url: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge_billing_key(&self, request: &ChargeRequest) -> BillingResult<ChargeReceipt>;

    async fn issue_billing_key(
        &self,
        request: &IssueBillingKeyRequest,
    ) -> BillingResult<IssuedBillingKey>;

    async fn cancel_payment(&self, request: &CancelPaymentRequest)
        -> BillingResult<CancelReceipt>;

    async fn confirm_escrow(
        &self,
        payment_key: &str,
        idempotency_key: &str,
    ) -> BillingResult<EscrowReceipt>;

    async fn issue_cash_receipt(
        &self,
        request: &CashReceiptRequest,
    ) -> BillingResult<IssuedCashReceipt>;
}
