use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// Payment rail - one external payment channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "rail_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Rail {
    Card,
    Bitpay,
    Nowpayments,
    Wire,
}

impl fmt::Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Rail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rail::Card => "card",
            Rail::Bitpay => "bitpay",
            Rail::Nowpayments => "nowpayments",
            Rail::Wire => "wire",
        }
    }

    /// Return all supported rails
    pub fn all() -> Vec<Rail> {
        vec![Rail::Card, Rail::Bitpay, Rail::Nowpayments, Rail::Wire]
    }
}

impl FromStr for Rail {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "card" => Ok(Rail::Card),
            "bitpay" => Ok(Rail::Bitpay),
            "nowpayments" => Ok(Rail::Nowpayments),
            "wire" => Ok(Rail::Wire),
            other => Err(AppError::BadRequest(format!("Unknown rail: {}", other))),
        }
    }
}

/// Asset the payer sends on the rail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "asset_code", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Usd,
    Btc,
    Eth,
    Usdt,
    Usdc,
    Sol,
    Ltc,
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Usd => "USD",
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Usdt => "USDT",
            Asset::Usdc => "USDC",
            Asset::Sol => "SOL",
            Asset::Ltc => "LTC",
        }
    }

    pub fn is_fiat(&self) -> bool {
        matches!(self, Asset::Usd)
    }
}

impl FromStr for Asset {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Asset::Usd),
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            // processors suffix the network for stablecoins (usdterc20, usdttrc20, usdcsol...)
            s if s.starts_with("USDT") => Ok(Asset::Usdt),
            s if s.starts_with("USDC") => Ok(Asset::Usdc),
            "SOL" => Ok(Asset::Sol),
            "LTC" => Ok(Asset::Ltc),
            other => Err(AppError::BadRequest(format!("Unsupported asset: {}", other))),
        }
    }
}

/// Invoice status state machine
///
/// pending -> partial -> confirmed -> credited, or diverts to failed / expired.
/// Credited, Failed and Expired are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "invoice_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Partial,
    Confirmed,
    Credited,
    Failed,
    Expired,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Confirmed => "confirmed",
            InvoiceStatus::Credited => "credited",
            InvoiceStatus::Failed => "failed",
            InvoiceStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Credited | InvoiceStatus::Failed | InvoiceStatus::Expired
        )
    }

    fn rank(&self) -> u8 {
        match self {
            InvoiceStatus::Pending => 0,
            InvoiceStatus::Partial => 1,
            InvoiceStatus::Confirmed => 2,
            InvoiceStatus::Credited => 3,
            InvoiceStatus::Failed | InvoiceStatus::Expired => 4,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only state machine.
    /// Re-applying the current non-terminal status is allowed (confirmation count updates).
    pub fn can_advance_to(&self, next: InvoiceStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            InvoiceStatus::Failed | InvoiceStatus::Expired => true,
            _ => next.rank() >= self.rank(),
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical status as reported by a rail, after the adapter folded the
/// vendor vocabulary. Never carries vendor names past the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedStatus {
    Pending,
    Partial,
    Confirmed,
    Failed,
    Expired,
}

impl ObservedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservedStatus::Pending => "pending",
            ObservedStatus::Partial => "partial",
            ObservedStatus::Confirmed => "confirmed",
            ObservedStatus::Failed => "failed",
            ObservedStatus::Expired => "expired",
        }
    }
}

/// Account entity - one per investor identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub balance: Decimal,
    pub available_balance: Decimal,
    pub total_deposits: Decimal,
    pub total_withdrawals: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance: Decimal::ZERO,
            available_balance: Decimal::ZERO,
            total_deposits: Decimal::ZERO,
            total_withdrawals: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Invoice entity - one funding attempt on one rail
///
/// INVARIANT: requested_amount_usd never changes after creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub rail: Rail,
    pub external_reference: String,
    pub owner_account_id: Uuid,
    pub requested_amount_usd: Decimal,
    pub asset: Asset,
    /// Asset-denominated amount from the rate snapshot taken at creation
    pub crypto_amount: Option<Decimal>,
    pub exchange_rate: Option<Decimal>,
    pub payment_target: String,
    pub status: InvoiceStatus,
    pub confirmations_observed: i32,
    pub confirmations_required: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Canonical, rail-agnostic representation of one inbound signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub external_reference: String,
    pub rail: Rail,
    pub observed: ObservedStatus,
    /// Vendor status string, kept for audit metadata and the dedup key only
    pub raw_status: String,
    pub amount_reported: Option<Decimal>,
    pub confirmations: u32,
    pub tx_hash: Option<String>,
    /// Owning account as embedded by the rail, if the rail embeds one
    pub account_hint: Option<Uuid>,
    pub asset: Option<Asset>,
}

/// Deduplication record for inbound events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub dedup_key: String,
    pub rail: Rail,
    pub external_reference: String,
    pub processed_at: DateTime<Utc>,
    /// Set inside the ledger unit of work that applied the event
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_tx_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deposit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_tx_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Completed,
    Failed,
}

/// Immutable audit row for a settlement outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub invoice_id: Uuid,
    pub kind: TransactionKind,
    pub rail: Rail,
    pub amount_usd: Decimal,
    pub status: TransactionStatus,
    pub external_reference: String,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl LedgerTransaction {
    /// Completed deposit for a confirmed invoice
    pub fn deposit(invoice: &Invoice, event: &SettlementEvent) -> Self {
        Self::build(invoice, event, TransactionStatus::Completed)
    }

    /// Informational row for an invoice that ended failed or expired
    pub fn failed_deposit(invoice: &Invoice, event: &SettlementEvent) -> Self {
        Self::build(invoice, event, TransactionStatus::Failed)
    }

    fn build(invoice: &Invoice, event: &SettlementEvent, status: TransactionStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: invoice.owner_account_id,
            invoice_id: invoice.id,
            kind: TransactionKind::Deposit,
            rail: invoice.rail,
            amount_usd: invoice.requested_amount_usd,
            status,
            external_reference: invoice.external_reference.clone(),
            created_at: Utc::now(),
            metadata: serde_json::json!({
                "asset": invoice.asset,
                "raw_status": event.raw_status,
                "confirmations": event.confirmations,
                "tx_hash": event.tx_hash,
                "amount_reported": event.amount_reported.map(|a| a.to_string()),
            }),
        }
    }
}

/// Outcome of offering an event to the idempotency gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First delivery of this key
    New,
    /// Seen before but the earlier application never committed
    Unapplied,
    /// Seen and applied - caller must no-op
    Duplicate,
}

/// Balance vs ledger check for one account
#[derive(Debug, Clone, Serialize)]
pub struct AccountReconciliation {
    pub account_id: Uuid,
    pub balance: Decimal,
    pub completed_total: Decimal,
    pub consistent: bool,
}

impl AccountReconciliation {
    pub fn check(account: &Account, transactions: &[LedgerTransaction]) -> Self {
        let completed_total = transactions
            .iter()
            .filter(|t| t.status == TransactionStatus::Completed)
            .map(|t| t.amount_usd)
            .sum::<Decimal>()
            - account.total_withdrawals;

        Self {
            account_id: account.id,
            balance: account.balance,
            completed_total,
            consistent: completed_total == account.balance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_transitions_are_forward_only() {
        assert!(InvoiceStatus::Pending.can_advance_to(InvoiceStatus::Partial));
        assert!(InvoiceStatus::Partial.can_advance_to(InvoiceStatus::Partial));
        assert!(InvoiceStatus::Partial.can_advance_to(InvoiceStatus::Credited));
        assert!(!InvoiceStatus::Partial.can_advance_to(InvoiceStatus::Pending));
        assert!(InvoiceStatus::Pending.can_advance_to(InvoiceStatus::Expired));

        // terminal states
        assert!(!InvoiceStatus::Credited.can_advance_to(InvoiceStatus::Failed));
        assert!(!InvoiceStatus::Expired.can_advance_to(InvoiceStatus::Credited));
        assert!(!InvoiceStatus::Failed.can_advance_to(InvoiceStatus::Failed));
    }

    #[test]
    fn test_asset_parsing_handles_network_suffixes() {
        assert_eq!("usdterc20".parse::<Asset>().unwrap(), Asset::Usdt);
        assert_eq!("btc".parse::<Asset>().unwrap(), Asset::Btc);
        assert!("doge".parse::<Asset>().is_err());
    }

    #[test]
    fn test_rail_parsing() {
        assert_eq!("NOWPayments".parse::<Rail>().unwrap(), Rail::Nowpayments);
        assert!("paypal".parse::<Rail>().is_err());
    }

    #[test]
    fn test_reconciliation_ignores_failed_rows() {
        let mut account = Account::new(Uuid::new_v4());
        account.balance = dec!(250);

        let row = |amount, status| LedgerTransaction {
            id: Uuid::new_v4(),
            account_id: account.id,
            invoice_id: Uuid::new_v4(),
            kind: TransactionKind::Deposit,
            rail: Rail::Card,
            amount_usd: amount,
            status,
            external_reference: "pi_1".into(),
            created_at: Utc::now(),
            metadata: serde_json::Value::Null,
        };

        let rows = vec![
            row(dec!(100), TransactionStatus::Completed),
            row(dec!(150), TransactionStatus::Completed),
            row(dec!(999), TransactionStatus::Failed),
        ];

        let check = AccountReconciliation::check(&account, &rows);
        assert!(check.consistent);
        assert_eq!(check.completed_total, dec!(250));
    }
}
