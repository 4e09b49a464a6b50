//! reqwest client for the provider's v1 REST API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{
    CancelPaymentRequest, CancelReceipt, CashReceiptRequest, ChargeReceipt, ChargeRequest,
    EscrowReceipt, IssueBillingKeyRequest, IssuedBillingKey, IssuedCashReceipt, PaymentGateway,
};
use crate::config::{env_parse, env_required};
use crate::error::{BillingError, BillingResult};
use crate::models::{CardMetadata, CashReceiptType};

const DEFAULT_BASE_URL: &str = "https://api.tosspayments.com";

/// Gateway connection settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub timeout: Duration,
    /// Total attempts per call, including the first
    pub max_attempts: usize,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            secret_key: secret_key.into(),
            timeout: Duration::from_secs(10),
            max_attempts: 3,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let secret_key = env_required("GATEWAY_SECRET_KEY")?;
        let base_url = env_parse("GATEWAY_BASE_URL", DEFAULT_BASE_URL.to_string())?;
        let timeout_secs = env_parse("GATEWAY_TIMEOUT_SECS", 10u64)?;
        let max_attempts = env_parse("GATEWAY_MAX_ATTEMPTS", 3usize)?;

        Ok(Self {
            base_url,
            secret_key,
            timeout: Duration::from_secs(timeout_secs),
            max_attempts: max_attempts.max(1),
        })
    }
}

/// Error envelope returned with every non-2xx response
#[derive(Debug, Deserialize)]
struct WireError {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireChargeBody<'a> {
    customer_key: &'a str,
    amount: i64,
    order_id: &'a str,
    order_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayment {
    payment_key: String,
    #[serde(default)]
    order_id: String,
    status: String,
    #[serde(default)]
    total_amount: i64,
    #[serde(default)]
    balance_amount: i64,
    #[serde(default)]
    cancels: Option<Vec<WireCancel>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCancel {
    transaction_key: Option<String>,
    cancel_amount: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireIssueBody<'a> {
    auth_key: &'a str,
    customer_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBillingKey {
    billing_key: String,
    customer_key: String,
    card_company: Option<String>,
    card: Option<WireCard>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCard {
    issuer_code: Option<String>,
    number: Option<String>,
    card_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireCancelBody<'a> {
    cancel_reason: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancel_amount: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireCashReceiptBody<'a> {
    amount: i64,
    order_id: &'a str,
    order_name: &'a str,
    customer_identity_number: &'a str,
    #[serde(rename = "type")]
    receipt_type: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCashReceipt {
    receipt_key: String,
    receipt_url: Option<String>,
}

/// Receipt type labels the provider expects
fn wire_receipt_type(receipt_type: CashReceiptType) -> &'static str {
    match receipt_type {
        CashReceiptType::IncomeDeduction => "소득공제",
        CashReceiptType::ExpenseProof => "지출증빙",
    }
}

pub struct HttpGateway {
    http: Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// POST with bounded exponential backoff. Only retryable failures are
    /// repeated; the same idempotency key is sent on every attempt.
    async fn post<B, T>(&self, path: &str, body: &B, idempotency_key: &str) -> BillingResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.max_attempts.saturating_sub(1));

        RetryIf::spawn(
            strategy,
            || self.send_once(&url, body, idempotency_key),
            |e: &BillingError| {
                let retry = e.is_retryable();
                if retry {
                    tracing::warn!(url = %url, error = %e, "Gateway call failed, retrying");
                }
                retry
            },
        )
        .await
    }

    async fn send_once<B, T>(&self, url: &str, body: &B, idempotency_key: &str) -> BillingResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .basic_auth(&self.config.secret_key, Some(""))
            .header("Idempotency-Key", idempotency_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
        let text = response.text().await.unwrap_or_default();
        let wire: Option<WireError> = serde_json::from_str(&text).ok();
        let (code, message) = match wire {
            Some(w) => (
                w.code.unwrap_or_else(|| format!("HTTP_{}", status.as_u16())),
                w.message.unwrap_or_default(),
            ),
            None => (format!("HTTP_{}", status.as_u16()), text),
        };

        Err(BillingError::gateway(code, message, retryable))
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn charge_billing_key(&self, request: &ChargeRequest) -> BillingResult<ChargeReceipt> {
        let body = WireChargeBody {
            customer_key: &request.customer_key,
            amount: request.amount,
            order_id: &request.order_id,
            order_name: &request.order_name,
        };
        let payment: WirePayment = self
            .post(
                &format!("/v1/billing/{}", request.billing_key),
                &body,
                &request.idempotency_key,
            )
            .await?;

        Ok(ChargeReceipt {
            payment_key: payment.payment_key,
            order_id: payment.order_id,
            status: payment.status,
            total_amount: payment.total_amount,
        })
    }

    async fn issue_billing_key(
        &self,
        request: &IssueBillingKeyRequest,
    ) -> BillingResult<IssuedBillingKey> {
        let body = WireIssueBody {
            auth_key: &request.auth_key,
            customer_key: &request.customer_key,
        };
        let issued: WireBillingKey = self
            .post(
                "/v1/billing/authorizations/issue",
                &body,
                &format!("issue:{}", request.auth_key),
            )
            .await?;

        let card = issued.card.unwrap_or(WireCard {
            issuer_code: None,
            number: None,
            card_type: None,
        });
        Ok(IssuedBillingKey {
            billing_key: issued.billing_key,
            customer_key: issued.customer_key,
            card: CardMetadata {
                issuer: issued.card_company.or(card.issuer_code),
                number_masked: card.number,
                card_type: card.card_type,
            },
        })
    }

    async fn cancel_payment(
        &self,
        request: &CancelPaymentRequest,
    ) -> BillingResult<CancelReceipt> {
        let body = WireCancelBody {
            cancel_reason: &request.cancel_reason,
            cancel_amount: request.cancel_amount,
        };
        let payment: WirePayment = self
            .post(
                &format!("/v1/payments/{}/cancel", request.payment_key),
                &body,
                &request.idempotency_key,
            )
            .await?;

        // The provider returns the whole payment; the newest cancel is ours.
        let last = payment.cancels.and_then(|mut c| c.pop());
        Ok(CancelReceipt {
            payment_key: payment.payment_key,
            status: payment.status,
            transaction_key: last.as_ref().and_then(|c| c.transaction_key.clone()),
            cancel_amount: last
                .map(|c| c.cancel_amount)
                .or(request.cancel_amount)
                .unwrap_or_default(),
            balance_amount: payment.balance_amount,
        })
    }

    async fn confirm_escrow(
        &self,
        payment_key: &str,
        idempotency_key: &str,
    ) -> BillingResult<EscrowReceipt> {
        let payment: WirePayment = self
            .post(
                &format!("/v1/payments/{}/escrow/confirm", payment_key),
                &serde_json::json!({}),
                idempotency_key,
            )
            .await?;

        Ok(EscrowReceipt {
            payment_key: payment.payment_key,
            status: payment.status,
        })
    }

    async fn issue_cash_receipt(
        &self,
        request: &CashReceiptRequest,
    ) -> BillingResult<IssuedCashReceipt> {
        let body = WireCashReceiptBody {
            amount: request.amount,
            order_id: &request.order_id,
            order_name: &request.order_name,
            customer_identity_number: &request.identity_number,
            receipt_type: wire_receipt_type(request.receipt_type),
        };
        let receipt: WireCashReceipt = self
            .post("/v1/cash-receipts", &body, &request.idempotency_key)
            .await?;

        Ok(IssuedCashReceipt {
            receipt_key: receipt.receipt_key,
            receipt_url: receipt.receipt_url,
        })
    }
}
