// In-memory ledger store for development runs without DATABASE_URL and for tests.
// Units of work lock the invoice they touch, not the store: each invoice has its
// own async mutex, held until the unit commits or drops. Writes are staged inside
// the unit and folded into the shared state on commit, so a dropped unit rolls
// back for free and units on different invoices never wait on each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::models::*;
use super::{duplicate_invoice, LedgerStore, LedgerUnit};
use crate::error::{AppError, AppResult};

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    invoices: HashMap<Uuid, Invoice>,
    references: HashMap<(Rail, String), Uuid>,
    idempotency: HashMap<String, IdempotencyRecord>,
    transactions: Vec<LedgerTransaction>,
    polled: HashMap<Uuid, DateTime<Utc>>,
}

impl MemoryState {
    fn has_completed(&self, invoice_id: Uuid) -> bool {
        self.transactions
            .iter()
            .any(|t| t.invoice_id == invoice_id && t.status == TransactionStatus::Completed)
    }
}

/// Step at which a unit of work can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    CreditAccount,
    InsertTransaction,
    UpdateInvoice,
    Commit,
}

#[derive(Default)]
struct Faults {
    armed: SyncMutex<Option<FaultPoint>>,
}

impl Faults {
    fn trip(&self, point: FaultPoint) -> AppResult<()> {
        let mut armed = self.armed.lock();
        if *armed == Some(point) {
            *armed = None;
            return Err(AppError::Internal(format!("injected fault at {:?}", point)));
        }
        Ok(())
    }
}

type RowLocks = SyncMutex<HashMap<Uuid, Arc<Mutex<()>>>>;

#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<RwLock<MemoryState>>,
    row_locks: Arc<RowLocks>,
    faults: Arc<Faults>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next unit of work fail once at `point`
    #[cfg(test)]
    pub fn fail_once(&self, point: FaultPoint) {
        *self.faults.armed.lock() = Some(point);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn ensure_account(&self, account_id: Uuid) -> AppResult<Account> {
        let mut state = self.state.write();
        let account = state
            .accounts
            .entry(account_id)
            .or_insert_with(|| Account::new(account_id));
        Ok(account.clone())
    }

    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>> {
        Ok(self.state.read().accounts.get(&account_id).cloned())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> AppResult<()> {
        let mut state = self.state.write();
        let key = (invoice.rail, invoice.external_reference.clone());
        if state.references.contains_key(&key) || state.invoices.contains_key(&invoice.id) {
            return Err(duplicate_invoice(invoice));
        }
        state.references.insert(key, invoice.id);
        state.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> AppResult<Option<Invoice>> {
        Ok(self.state.read().invoices.get(&invoice_id).cloned())
    }

    async fn find_invoice_by_reference(
        &self,
        rail: Rail,
        external_reference: &str,
    ) -> AppResult<Option<Invoice>> {
        let state = self.state.read();
        Ok(state
            .references
            .get(&(rail, external_reference.to_string()))
            .and_then(|id| state.invoices.get(id))
            .cloned())
    }

    async fn list_open_invoices(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Invoice>> {
        let state = self.state.read();
        let mut open: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| i.is_open() && i.created_at < created_before)
            .cloned()
            .collect();
        // None sorts before Some, so never-polled invoices lead
        open.sort_by_key(|i| (state.polled.get(&i.id).copied(), i.created_at));
        open.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(open)
    }

    async fn mark_polled(&self, invoice_ids: &[Uuid], at: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.state.write();
        for id in invoice_ids {
            state.polled.insert(*id, at);
        }
        Ok(())
    }

    async fn list_transactions(&self, account_id: Uuid) -> AppResult<Vec<LedgerTransaction>> {
        let state = self.state.read();
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn insert_idempotency_record(&self, record: &IdempotencyRecord) -> AppResult<Admission> {
        let mut state = self.state.write();
        match state.idempotency.get(&record.dedup_key) {
            Some(existing) if existing.applied_at.is_some() => Ok(Admission::Duplicate),
            Some(_) => Ok(Admission::Unapplied),
            None => {
                state
                    .idempotency
                    .insert(record.dedup_key.clone(), record.clone());
                Ok(Admission::New)
            }
        }
    }

    async fn begin(&self) -> AppResult<Box<dyn LedgerUnit>> {
        Ok(Box::new(MemoryLedgerUnit {
            state: self.state.clone(),
            row_locks: self.row_locks.clone(),
            held: HashMap::new(),
            staged: Staged::default(),
            faults: self.faults.clone(),
        }))
    }
}

/// Writes a unit has made but not yet committed
#[derive(Default)]
struct Staged {
    invoices: HashMap<Uuid, (InvoiceStatus, i32)>,
    credits: HashMap<Uuid, Decimal>,
    transactions: Vec<LedgerTransaction>,
    applied: Vec<String>,
}

pub struct MemoryLedgerUnit {
    state: Arc<RwLock<MemoryState>>,
    row_locks: Arc<RowLocks>,
    held: HashMap<Uuid, OwnedMutexGuard<()>>,
    staged: Staged,
    faults: Arc<Faults>,
}

impl MemoryLedgerUnit {
    fn row_lock(&self, invoice_id: Uuid) -> Arc<Mutex<()>> {
        self.row_locks.lock().entry(invoice_id).or_default().clone()
    }
}

#[async_trait]
impl LedgerUnit for MemoryLedgerUnit {
    async fn lock_invoice(&mut self, invoice_id: Uuid) -> AppResult<Invoice> {
        if !self.held.contains_key(&invoice_id) {
            let guard = self.row_lock(invoice_id).lock_owned().await;
            self.held.insert(invoice_id, guard);
        }

        let mut invoice = self
            .state
            .read()
            .invoices
            .get(&invoice_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("invoice {}", invoice_id)))?;
        if let Some((status, confirmations)) = self.staged.invoices.get(&invoice_id) {
            invoice.status = *status;
            invoice.confirmations_observed = invoice.confirmations_observed.max(*confirmations);
        }
        Ok(invoice)
    }

    async fn credit_account(&mut self, account_id: Uuid, amount: Decimal) -> AppResult<()> {
        self.faults.trip(FaultPoint::CreditAccount)?;
        if !self.state.read().accounts.contains_key(&account_id) {
            return Err(AppError::NotFound(format!("account {}", account_id)));
        }
        *self.staged.credits.entry(account_id).or_default() += amount;
        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &LedgerTransaction) -> AppResult<()> {
        self.faults.trip(FaultPoint::InsertTransaction)?;
        let completed_exists = transaction.status == TransactionStatus::Completed
            && (self.state.read().has_completed(transaction.invoice_id)
                || self.staged.transactions.iter().any(|t| {
                    t.invoice_id == transaction.invoice_id
                        && t.status == TransactionStatus::Completed
                }));
        if completed_exists {
            return Err(AppError::Internal(format!(
                "completed transaction already exists for invoice {}",
                transaction.invoice_id
            )));
        }
        self.staged.transactions.push(transaction.clone());
        Ok(())
    }

    async fn update_invoice(
        &mut self,
        invoice_id: Uuid,
        status: InvoiceStatus,
        confirmations: i32,
    ) -> AppResult<()> {
        self.faults.trip(FaultPoint::UpdateInvoice)?;
        if !self.state.read().invoices.contains_key(&invoice_id) {
            return Err(AppError::NotFound(format!("invoice {}", invoice_id)));
        }
        let entry = self
            .staged
            .invoices
            .entry(invoice_id)
            .or_insert((status, confirmations));
        entry.0 = status;
        entry.1 = entry.1.max(confirmations);
        Ok(())
    }

    async fn mark_applied(&mut self, dedup_key: &str) -> AppResult<()> {
        self.staged.applied.push(dedup_key.to_string());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.faults.trip(FaultPoint::Commit)?;
        let MemoryLedgerUnit {
            state,
            held,
            staged,
            ..
        } = *self;

        let now = Utc::now();
        let mut state = state.write();

        // a unit that skipped lock_invoice could still race; hold the one-credit rule here too
        for transaction in &staged.transactions {
            if transaction.status == TransactionStatus::Completed
                && state.has_completed(transaction.invoice_id)
            {
                return Err(AppError::Internal(format!(
                    "completed transaction already exists for invoice {}",
                    transaction.invoice_id
                )));
            }
        }

        for (account_id, amount) in staged.credits {
            if let Some(account) = state.accounts.get_mut(&account_id) {
                account.balance += amount;
                account.available_balance += amount;
                account.total_deposits += amount;
                account.updated_at = now;
            }
        }
        for (invoice_id, (status, confirmations)) in staged.invoices {
            if let Some(invoice) = state.invoices.get_mut(&invoice_id) {
                invoice.status = status;
                invoice.confirmations_observed = invoice.confirmations_observed.max(confirmations);
                invoice.updated_at = now;
            }
        }
        state.transactions.extend(staged.transactions);
        for key in staged.applied {
            if let Some(record) = state.idempotency.get_mut(&key) {
                record.applied_at.get_or_insert(now);
            }
        }

        drop(state);
        drop(held);
        Ok(())
    }
}
