pub mod memory;
pub mod models;
pub mod repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use models::*;

pub use memory::MemoryLedgerStore;
pub use repository::LedgerRepository;

/// Both backends answer a second invoice for the same rail reference with this
pub(crate) fn duplicate_invoice(invoice: &Invoice) -> AppError {
    AppError::BadRequest(format!(
        "invoice for {} {} already exists",
        invoice.rail, invoice.external_reference
    ))
}

/// Durable account/ledger store - THE source of truth for settlement state.
///
/// Reads outside a [`LedgerUnit`] are snapshots; every balance or invoice
/// status mutation goes through `begin()`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Short name of the backing store, reported by the health endpoint
    fn backend(&self) -> &'static str;

    /// Cheap liveness check
    async fn ping(&self) -> AppResult<()>;

    /// Upsert the account row for an investor identity
    async fn ensure_account(&self, account_id: Uuid) -> AppResult<Account>;

    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>>;

    async fn insert_invoice(&self, invoice: &Invoice) -> AppResult<()>;

    async fn get_invoice(&self, invoice_id: Uuid) -> AppResult<Option<Invoice>>;

    async fn find_invoice_by_reference(
        &self,
        rail: Rail,
        external_reference: &str,
    ) -> AppResult<Option<Invoice>>;

    /// Non-terminal invoices created before `created_before`. Never-polled
    /// invoices come first, then the least recently polled, then the oldest.
    async fn list_open_invoices(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Invoice>>;

    /// Record that the poller picked these invoices up at `at`
    async fn mark_polled(&self, invoice_ids: &[Uuid], at: DateTime<Utc>) -> AppResult<()>;

    async fn list_transactions(&self, account_id: Uuid) -> AppResult<Vec<LedgerTransaction>>;

    /// Atomic insert-or-fail of a dedup record
    async fn insert_idempotency_record(&self, record: &IdempotencyRecord) -> AppResult<Admission>;

    /// Open an atomic unit of work. Dropping it without `commit` rolls back.
    async fn begin(&self) -> AppResult<Box<dyn LedgerUnit>>;
}

/// One atomic unit of work against the store
#[async_trait]
pub trait LedgerUnit: Send {
    /// Lock the invoice row for the rest of the unit and return its current state
    async fn lock_invoice(&mut self, invoice_id: Uuid) -> AppResult<Invoice>;

    async fn credit_account(&mut self, account_id: Uuid, amount: Decimal) -> AppResult<()>;

    async fn insert_transaction(&mut self, transaction: &LedgerTransaction) -> AppResult<()>;

    /// Set status and raise (never lower) the observed confirmation count
    async fn update_invoice(
        &mut self,
        invoice_id: Uuid,
        status: InvoiceStatus,
        confirmations: i32,
    ) -> AppResult<()>;

    async fn mark_applied(&mut self, dedup_key: &str) -> AppResult<()>;

    async fn commit(self: Box<Self>) -> AppResult<()>;
}
