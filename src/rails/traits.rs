use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppResult, SettlementError};
use crate::ledger::models::{Asset, ObservedStatus, Rail, SettlementEvent};

/// What a rail needs to open a payment for a new invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentDraft {
    pub invoice_id: Uuid,
    pub account_id: Uuid,
    pub amount_usd: Decimal,
    pub asset: Asset,
    pub crypto_amount: Option<Decimal>,
    pub expires_at: DateTime<Utc>,
    /// Where the rail should deliver webhooks for this payment
    pub callback_url: String,
}

/// Rail-side handle for an opened payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInstructions {
    pub external_reference: String,
    /// Deposit address, hosted checkout URL, client secret or wire instructions
    pub payment_target: String,
}

/// One adapter per payment rail. Normalization is pure and never touches
/// the ledger; the outbound calls are bounded by the client timeout.
#[async_trait]
pub trait RailAdapter: Send + Sync {
    fn rail(&self) -> Rail;

    fn supports_asset(&self, asset: Asset) -> bool;

    /// Confirmations needed before the rail's payment is final. 0 = binary settlement.
    fn required_confirmations(&self, asset: Asset) -> u32;

    /// Authenticate an inbound webhook. Rails without a configured secret accept everything.
    fn verify_signature(&self, _headers: &HeaderMap, _body: &[u8]) -> AppResult<()> {
        Ok(())
    }

    /// Whether a webhook body may be applied as-is. Rails with unsigned
    /// notifications return false and get re-read through `fetch_status`.
    fn trusts_webhook_payload(&self) -> bool {
        true
    }

    /// Fold a raw webhook body into the canonical event
    fn normalize(&self, payload: &[u8]) -> AppResult<SettlementEvent>;

    async fn open_payment(&self, draft: &PaymentDraft) -> AppResult<PaymentInstructions>;

    /// Actively query the rail for the current state of a payment
    async fn fetch_status(&self, external_reference: &str) -> AppResult<SettlementEvent>;
}

/// Fold the vendor status vocabulary shared by the rails in scope into the
/// canonical set. Returns `None` for statuses no rail is known to send.
pub fn fold_status(raw: &str) -> Option<ObservedStatus> {
    let status = match raw.to_ascii_lowercase().as_str() {
        "finished" | "confirmed" | "paid" | "complete" | "completed" | "succeeded"
        | "settled" => ObservedStatus::Confirmed,
        "partially_paid" | "paidpartial" => ObservedStatus::Partial,
        "failed" | "invalid" | "refunded" | "canceled" | "cancelled" | "declined"
        | "returned" | "rejected" => ObservedStatus::Failed,
        "expired" => ObservedStatus::Expired,
        "waiting" | "confirming" | "sending" | "new" | "pending" | "processing" | "received"
        | "requires_payment_method" | "requires_confirmation" | "requires_action"
        | "requires_capture" => ObservedStatus::Pending,
        _ => return None,
    };
    Some(status)
}

pub fn fold_status_or_reject(rail: Rail, raw: &str) -> Result<ObservedStatus, SettlementError> {
    fold_status(raw).ok_or_else(|| {
        SettlementError::validation(format!("{} reported unknown status '{}'", rail, raw))
    })
}

pub fn parse_payload<'a, T: Deserialize<'a>>(rail: Rail, payload: &'a [u8]) -> Result<T, SettlementError> {
    serde_json::from_slice(payload)
        .map_err(|e| SettlementError::validation(format!("malformed {} payload: {}", rail, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_covers_every_rail_vocabulary() {
        for raw in ["finished", "confirmed", "paid", "complete", "succeeded"] {
            assert_eq!(fold_status(raw), Some(ObservedStatus::Confirmed), "{}", raw);
        }
        assert_eq!(fold_status("partially_paid"), Some(ObservedStatus::Partial));
        assert_eq!(fold_status("paidPartial"), Some(ObservedStatus::Partial));
        assert_eq!(fold_status("failed"), Some(ObservedStatus::Failed));
        assert_eq!(fold_status("expired"), Some(ObservedStatus::Expired));
        assert_eq!(fold_status("waiting"), Some(ObservedStatus::Pending));
        assert_eq!(fold_status("confirming"), Some(ObservedStatus::Pending));
        assert_eq!(fold_status("teleported"), None);
    }

    #[test]
    fn test_unknown_status_is_a_validation_error() {
        let err = fold_status_or_reject(Rail::Bitpay, "mystery").unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
    }
}
