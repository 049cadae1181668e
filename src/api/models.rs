use crate::ledger::models::*;
use crate::settlement::{AccountSummary, InvoiceReceipt};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

// ========== REQUEST MODELS ==========

fn positive_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_negative() || amount.is_zero() {
        return Err(ValidationError::new("amount_must_be_positive"));
    }
    if amount.normalize().scale() > 2 {
        return Err(ValidationError::new("amount_has_more_than_two_decimals"));
    }
    Ok(())
}

/// POST /invoices
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvoiceRequest {
    pub account_id: Uuid,

    #[validate(custom = "positive_amount")]
    pub amount_usd: Decimal,

    /// Asset code, e.g. `BTC`, `USDT`, `USD`
    #[validate(length(min = 3, max = 12))]
    pub asset: String,

    #[validate(length(min = 1))]
    pub rail: String,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvoiceResponse {
    pub invoice_id: Uuid,
    pub rail: Rail,
    pub asset: Asset,
    pub external_reference: String,
    pub payment_address_or_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_rate: Option<Decimal>,
    pub confirmations_required: i32,
    pub expires_at: DateTime<Utc>,
}

impl From<InvoiceReceipt> for CreateInvoiceResponse {
    fn from(receipt: InvoiceReceipt) -> Self {
        Self {
            invoice_id: receipt.invoice_id,
            rail: receipt.rail,
            asset: receipt.asset,
            external_reference: receipt.external_reference,
            payment_address_or_url: receipt.payment_target,
            crypto_amount: receipt.crypto_amount,
            exchange_rate: receipt.exchange_rate,
            confirmations_required: receipt.confirmations_required,
            expires_at: receipt.expires_at,
        }
    }
}

/// GET /invoices/:id/status
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceStatusResponse {
    pub invoice_id: Uuid,
    pub status: InvoiceStatus,
    pub confirmations: i32,
    pub confirmations_required: i32,
}

/// GET /invoices/:id
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceResponse {
    pub invoice_id: Uuid,
    pub rail: Rail,
    pub external_reference: String,
    pub account_id: Uuid,
    pub amount_usd: Decimal,
    pub asset: Asset,
    pub crypto_amount: Option<Decimal>,
    pub exchange_rate: Option<Decimal>,
    pub payment_address_or_url: String,
    pub status: InvoiceStatus,
    pub confirmations: i32,
    pub confirmations_required: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Invoice> for InvoiceResponse {
    fn from(invoice: Invoice) -> Self {
        Self {
            invoice_id: invoice.id,
            rail: invoice.rail,
            external_reference: invoice.external_reference,
            account_id: invoice.owner_account_id,
            amount_usd: invoice.requested_amount_usd,
            asset: invoice.asset,
            crypto_amount: invoice.crypto_amount,
            exchange_rate: invoice.exchange_rate,
            payment_address_or_url: invoice.payment_target,
            status: invoice.status,
            confirmations: invoice.confirmations_observed,
            confirmations_required: invoice.confirmations_required,
            created_at: invoice.created_at,
            expires_at: invoice.expires_at,
            updated_at: invoice.updated_at,
        }
    }
}

/// GET /accounts/:id
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub account_id: Uuid,
    pub balance: Decimal,
    pub available_balance: Decimal,
    pub total_deposits: Decimal,
    pub total_withdrawals: Decimal,
    /// Sum of completed ledger rows net of withdrawals
    pub ledger_total: Decimal,
    pub ledger_consistent: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<AccountSummary> for AccountResponse {
    fn from(summary: AccountSummary) -> Self {
        Self {
            account_id: summary.account.id,
            balance: summary.account.balance,
            available_balance: summary.account.available_balance,
            total_deposits: summary.account.total_deposits,
            total_withdrawals: summary.account.total_withdrawals,
            ledger_total: summary.reconciliation.completed_total,
            ledger_consistent: summary.reconciliation.consistent,
            updated_at: summary.account.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub transaction_id: Uuid,
    pub invoice_id: Uuid,
    pub kind: TransactionKind,
    pub rail: Rail,
    pub amount_usd: Decimal,
    pub status: TransactionStatus,
    pub external_reference: String,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl From<LedgerTransaction> for TransactionResponse {
    fn from(tx: LedgerTransaction) -> Self {
        Self {
            transaction_id: tx.id,
            invoice_id: tx.invoice_id,
            kind: tx.kind,
            rail: tx.rail,
            amount_usd: tx.amount_usd,
            status: tx.status,
            external_reference: tx.external_reference,
            created_at: tx.created_at,
            metadata: tx.metadata,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub store: String,
    pub rails: Vec<Rail>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(amount: Decimal) -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            account_id: Uuid::new_v4(),
            amount_usd: amount,
            asset: "BTC".into(),
            rail: "nowpayments".into(),
        }
    }

    #[test]
    fn test_amount_validation() {
        assert!(request(dec!(5000)).validate().is_ok());
        assert!(request(dec!(100.50)).validate().is_ok());
        assert!(request(dec!(0)).validate().is_err());
        assert!(request(dec!(-10)).validate().is_err());
        assert!(request(dec!(100.001)).validate().is_err());
    }

    #[test]
    fn test_request_uses_camel_case() {
        let body = r#"{"accountId":"6f1c2a9e-3b4d-4c5e-8f70-1a2b3c4d5e6f","amountUsd":5000,"asset":"BTC","rail":"nowpayments"}"#;
        let parsed: CreateInvoiceRequest = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.amount_usd, dec!(5000));
    }
}
