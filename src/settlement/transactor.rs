use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, SettlementError};
use crate::ledger::models::{InvoiceStatus, LedgerTransaction, SettlementEvent};
use crate::ledger::{LedgerStore, LedgerUnit};

/// What one unit of work did to an invoice
#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    Credited(LedgerTransaction),
    /// The invoice was credited by an earlier unit; nothing moved
    AlreadyCredited,
    Advanced(InvoiceStatus),
    Closed(InvoiceStatus),
    /// Stale or out-of-order observation; invoice kept its status
    Unchanged(InvoiceStatus),
}

impl SettlementOutcome {
    pub fn status(&self) -> InvoiceStatus {
        match self {
            SettlementOutcome::Credited(_) | SettlementOutcome::AlreadyCredited => {
                InvoiceStatus::Credited
            }
            SettlementOutcome::Advanced(s)
            | SettlementOutcome::Closed(s)
            | SettlementOutcome::Unchanged(s) => *s,
        }
    }
}

/// Applies policy decisions to the ledger. Every method runs as a single
/// unit of work that locks the invoice row and re-reads its status first,
/// so concurrent deliveries of the same payment serialize on that row.
pub struct LedgerTransactor {
    store: Arc<dyn LedgerStore>,
}

fn write_failed(invoice_id: Uuid) -> impl Fn(AppError) -> SettlementError {
    move |e| {
        error!(invoice = %invoice_id, "Ledger unit rolled back: {}", e);
        SettlementError::LedgerWriteFailed(format!("invoice {}: {}", invoice_id, e))
    }
}

fn confirmations_of(event: &SettlementEvent) -> i32 {
    i32::try_from(event.confirmations).unwrap_or(i32::MAX)
}

impl LedgerTransactor {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Credit the owner for a confirmed invoice, exactly once
    pub async fn settle(
        &self,
        invoice_id: Uuid,
        event: &SettlementEvent,
        dedup_key: &str,
    ) -> Result<SettlementOutcome, SettlementError> {
        let fail = write_failed(invoice_id);
        let mut unit = self.store.begin().await.map_err(&fail)?;
        let invoice = unit.lock_invoice(invoice_id).await.map_err(&fail)?;

        match invoice.status {
            InvoiceStatus::Credited => {
                Self::finish(unit, dedup_key).await.map_err(&fail)?;
                return Ok(SettlementOutcome::AlreadyCredited);
            }
            InvoiceStatus::Failed | InvoiceStatus::Expired => {
                // consume the event so redeliveries short-circuit at the gate
                Self::finish(unit, dedup_key).await.map_err(&fail)?;
                warn!(
                    invoice = %invoice_id,
                    status = %invoice.status,
                    "Confirmation arrived for a closed invoice"
                );
                return Err(SettlementError::TerminalRailFailure {
                    invoice_id,
                    status: invoice.status,
                });
            }
            _ => {}
        }

        let transaction = LedgerTransaction::deposit(&invoice, event);

        unit.credit_account(invoice.owner_account_id, invoice.requested_amount_usd)
            .await
            .map_err(&fail)?;
        unit.insert_transaction(&transaction).await.map_err(&fail)?;
        unit.update_invoice(invoice_id, InvoiceStatus::Credited, confirmations_of(event))
            .await
            .map_err(&fail)?;
        Self::finish(unit, dedup_key).await.map_err(&fail)?;

        info!(
            invoice = %invoice_id,
            account = %invoice.owner_account_id,
            amount_usd = %invoice.requested_amount_usd,
            rail = %invoice.rail,
            "✓ Invoice credited"
        );
        Ok(SettlementOutcome::Credited(transaction))
    }

    /// Record forward progress (pending / partial and the confirmation count)
    pub async fn advance(
        &self,
        invoice_id: Uuid,
        event: &SettlementEvent,
        status: InvoiceStatus,
        dedup_key: &str,
    ) -> Result<SettlementOutcome, SettlementError> {
        let fail = write_failed(invoice_id);
        let mut unit = self.store.begin().await.map_err(&fail)?;
        let invoice = unit.lock_invoice(invoice_id).await.map_err(&fail)?;

        if !invoice.status.can_advance_to(status) {
            Self::finish(unit, dedup_key).await.map_err(&fail)?;
            return Ok(SettlementOutcome::Unchanged(invoice.status));
        }

        unit.update_invoice(invoice_id, status, confirmations_of(event))
            .await
            .map_err(&fail)?;
        Self::finish(unit, dedup_key).await.map_err(&fail)?;

        info!(
            invoice = %invoice_id,
            from = %invoice.status,
            to = %status,
            confirmations = event.confirmations,
            "Invoice advanced"
        );
        Ok(SettlementOutcome::Advanced(status))
    }

    /// Move an open invoice to failed or expired, leaving a failed ledger row behind
    pub async fn close(
        &self,
        invoice_id: Uuid,
        event: &SettlementEvent,
        status: InvoiceStatus,
        dedup_key: &str,
    ) -> Result<SettlementOutcome, SettlementError> {
        let fail = write_failed(invoice_id);
        let mut unit = self.store.begin().await.map_err(&fail)?;
        let invoice = unit.lock_invoice(invoice_id).await.map_err(&fail)?;

        if !invoice.status.can_advance_to(status) {
            Self::finish(unit, dedup_key).await.map_err(&fail)?;
            return Ok(SettlementOutcome::Unchanged(invoice.status));
        }

        unit.update_invoice(invoice_id, status, confirmations_of(event))
            .await
            .map_err(&fail)?;
        unit.insert_transaction(&LedgerTransaction::failed_deposit(&invoice, event))
            .await
            .map_err(&fail)?;
        Self::finish(unit, dedup_key).await.map_err(&fail)?;

        warn!(invoice = %invoice_id, status = %status, raw = %event.raw_status, "Invoice closed");
        Ok(SettlementOutcome::Closed(status))
    }

    async fn finish(mut unit: Box<dyn LedgerUnit>, dedup_key: &str) -> Result<(), AppError> {
        unit.mark_applied(dedup_key).await?;
        unit.commit().await
    }
}
