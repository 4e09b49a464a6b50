//! Scriptable in-process gateway

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    CancelPaymentRequest, CancelReceipt, CashReceiptRequest, ChargeReceipt, ChargeRequest,
    EscrowReceipt, IssueBillingKeyRequest, IssuedBillingKey, IssuedCashReceipt, PaymentGateway,
};
use crate::error::{BillingError, BillingResult};
use crate::models::CardMetadata;

/// A request the fake received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Charge(ChargeRequest),
    IssueBillingKey(IssueBillingKeyRequest),
    Cancel(CancelPaymentRequest),
    ConfirmEscrow(String),
    CashReceipt(CashReceiptRequest),
}

#[derive(Default)]
struct Script {
    /// Decline codes for upcoming charges; empty queue means approve
    charge_failures: VecDeque<String>,
    cancel_failures: VecDeque<String>,
    charge_delay: Option<Duration>,
    cancel_delay: Option<Duration>,
    /// Executed cancels by idempotency key, replayed on a repeat key
    cancels: HashMap<String, CancelReceipt>,
    calls: Vec<GatewayCall>,
    sequence: u64,
}

/// Approves everything unless told otherwise and records every call
#[derive(Default)]
pub struct FakeGateway {
    script: Mutex<Script>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut guard = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Decline the next `n` charges with `code`
    pub fn fail_next_charges(&self, n: usize, code: &str) {
        self.with_script(|s| {
            for _ in 0..n {
                s.charge_failures.push_back(code.to_string());
            }
        });
    }

    pub fn fail_next_cancel(&self, code: &str) {
        self.with_script(|s| s.cancel_failures.push_back(code.to_string()));
    }

    /// Make every charge take this long before answering
    pub fn set_charge_delay(&self, delay: Option<Duration>) {
        self.with_script(|s| s.charge_delay = delay);
    }

    pub fn set_cancel_delay(&self, delay: Option<Duration>) {
        self.with_script(|s| s.cancel_delay = delay);
    }

    /// Cancels actually executed, replays excluded
    pub fn executed_cancels(&self) -> Vec<CancelReceipt> {
        self.with_script(|s| s.cancels.values().cloned().collect())
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.with_script(|s| s.calls.clone())
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.with_script(|s| {
            s.calls
                .iter()
                .filter_map(|c| match c {
                    GatewayCall::Charge(r) => Some(r.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn charge_count(&self) -> usize {
        self.charges().len()
    }

    fn next_sequence(s: &mut Script) -> u64 {
        s.sequence += 1;
        s.sequence
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn charge_billing_key(&self, request: &ChargeRequest) -> BillingResult<ChargeReceipt> {
        let (delay, failure, seq) = self.with_script(|s| {
            s.calls.push(GatewayCall::Charge(request.clone()));
            let seq = Self::next_sequence(s);
            (s.charge_delay, s.charge_failures.pop_front(), seq)
        });

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(code) = failure {
            return Err(BillingError::gateway(code, "declined by fake gateway", false));
        }

        Ok(ChargeReceipt {
            payment_key: format!("pay_fake_{}", seq),
            order_id: request.order_id.clone(),
            status: "DONE".to_string(),
            total_amount: request.amount,
        })
    }

    async fn issue_billing_key(
        &self,
        request: &IssueBillingKeyRequest,
    ) -> BillingResult<IssuedBillingKey> {
        let seq = self.with_script(|s| {
            s.calls.push(GatewayCall::IssueBillingKey(request.clone()));
            Self::next_sequence(s)
        });

        Ok(IssuedBillingKey {
            billing_key: format!("bk_fake_{}", seq),
            customer_key: request.customer_key.clone(),
            card: CardMetadata {
                issuer: Some("FakeCard".to_string()),
                number_masked: Some("4111********1111".to_string()),
                card_type: Some("credit".to_string()),
            },
        })
    }

    async fn cancel_payment(
        &self,
        request: &CancelPaymentRequest,
    ) -> BillingResult<CancelReceipt> {
        let (delay, result) = self.with_script(|s| {
            s.calls.push(GatewayCall::Cancel(request.clone()));
            if let Some(done) = s.cancels.get(&request.idempotency_key) {
                return (s.cancel_delay, Ok(done.clone()));
            }
            if let Some(code) = s.cancel_failures.pop_front() {
                return (s.cancel_delay, Err(code));
            }
            let receipt = CancelReceipt {
                payment_key: request.payment_key.clone(),
                status: "PARTIAL_CANCELED".to_string(),
                transaction_key: Some(format!("tx_fake_{}", Self::next_sequence(s))),
                cancel_amount: request.cancel_amount.unwrap_or_default(),
                balance_amount: 0,
            };
            s.cancels
                .insert(request.idempotency_key.clone(), receipt.clone());
            (s.cancel_delay, Ok(receipt))
        });

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        result.map_err(|code| BillingError::gateway(code, "cancel rejected by fake gateway", false))
    }

    async fn confirm_escrow(
        &self,
        payment_key: &str,
        _idempotency_key: &str,
    ) -> BillingResult<EscrowReceipt> {
        self.with_script(|s| s.calls.push(GatewayCall::ConfirmEscrow(payment_key.to_string())));
        Ok(EscrowReceipt {
            payment_key: payment_key.to_string(),
            status: "DONE".to_string(),
        })
    }

    async fn issue_cash_receipt(
        &self,
        request: &CashReceiptRequest,
    ) -> BillingResult<IssuedCashReceipt> {
        let seq = self.with_script(|s| {
            s.calls.push(GatewayCall::CashReceipt(request.clone()));
            Self::next_sequence(s)
        });
        Ok(IssuedCashReceipt {
            receipt_key: format!("rcpt_fake_{}", seq),
            receipt_url: Some(format!("https://receipts.example/rcpt_fake_{}", seq)),
        })
    }
}
