use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::gate::IdempotencyGate;
use super::policy::ConfirmationPolicy;
use super::transactor::{LedgerTransactor, SettlementOutcome};
use crate::config::Config;
use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::{
    Account, AccountReconciliation, Admission, Asset, Invoice, InvoiceStatus, LedgerTransaction,
    ObservedStatus, Rail, SettlementEvent,
};
use crate::ledger::LedgerStore;
use crate::rails::{PaymentDraft, RailRegistry};
use crate::rates::RateSource;

/// Vendor status recorded when the engine closes an invoice its rail stopped answering for
const DEADLINE_STATUS: &str = "deadline_passed";

/// Invoice creation knobs taken from configuration
#[derive(Debug, Clone)]
pub struct InvoiceSettings {
    pub min_invoice_usd: Decimal,
    pub public_base_url: String,
    pub expiry: HashMap<Rail, Duration>,
}

impl InvoiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_invoice_usd: config.min_invoice_usd,
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            expiry: Rail::all()
                .into_iter()
                .map(|rail| (rail, config.expiry_for(rail)))
                .collect(),
        }
    }

    fn expiry_for(&self, rail: Rail) -> Duration {
        self.expiry.get(&rail).copied().unwrap_or_else(|| Duration::hours(24))
    }
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub account_id: Uuid,
    pub amount_usd: Decimal,
    pub asset: Asset,
    pub rail: Rail,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceReceipt {
    pub invoice_id: Uuid,
    pub rail: Rail,
    pub asset: Asset,
    pub external_reference: String,
    pub payment_target: String,
    pub crypto_amount: Option<Decimal>,
    pub exchange_rate: Option<Decimal>,
    pub confirmations_required: i32,
    pub expires_at: DateTime<Utc>,
}

/// Result of pushing one event through gate, policy and transactor
#[derive(Debug, Clone)]
pub struct SettlementReport {
    pub invoice_id: Uuid,
    pub status: InvoiceStatus,
    pub duplicate: bool,
    pub outcome: Option<SettlementOutcome>,
}

/// Returned to the rail once its delivery is durably admitted
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub accepted: bool,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<InvoiceStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account: Account,
    pub reconciliation: AccountReconciliation,
}

/// Single entry point for settlement. Webhooks and the poller both end up in
/// `apply_event`, so there is exactly one path from an observation to the ledger.
pub struct SettlementOrchestrator {
    store: Arc<dyn LedgerStore>,
    rails: Arc<RailRegistry>,
    rates: Arc<dyn RateSource>,
    gate: IdempotencyGate,
    transactor: LedgerTransactor,
    settings: InvoiceSettings,
}

impl SettlementOrchestrator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        rails: Arc<RailRegistry>,
        rates: Arc<dyn RateSource>,
        settings: InvoiceSettings,
    ) -> Self {
        Self {
            gate: IdempotencyGate::new(store.clone()),
            transactor: LedgerTransactor::new(store.clone()),
            store,
            rails,
            rates,
            settings,
        }
    }

    pub fn rails(&self) -> &RailRegistry {
        &self.rails
    }

    /// Ping the ledger store and report which backend is serving
    pub async fn health(&self) -> AppResult<&'static str> {
        self.store.ping().await?;
        Ok(self.store.backend())
    }

    pub async fn create_invoice(&self, request: NewInvoice) -> AppResult<InvoiceReceipt> {
        if request.amount_usd < self.settings.min_invoice_usd {
            return Err(SettlementError::validation(format!(
                "amountUsd must be at least {}",
                self.settings.min_invoice_usd
            ))
            .into());
        }

        let adapter = self.rails.get(request.rail)?;
        if !adapter.supports_asset(request.asset) {
            return Err(SettlementError::validation(format!(
                "rail {} does not accept {}",
                request.rail, request.asset
            ))
            .into());
        }

        self.store.ensure_account(request.account_id).await?;

        // one snapshot per invoice; the amount owed never follows the market afterwards
        let (crypto_amount, exchange_rate) = if request.asset.is_fiat() {
            (None, None)
        } else {
            let snapshot = self.rates.snapshot(request.asset).await?;
            (
                Some(snapshot.convert(request.amount_usd)?),
                Some(snapshot.usd_per_unit),
            )
        };

        let now = Utc::now();
        let invoice_id = Uuid::new_v4();
        let expires_at = now + self.settings.expiry_for(request.rail);

        let draft = PaymentDraft {
            invoice_id,
            account_id: request.account_id,
            amount_usd: request.amount_usd,
            asset: request.asset,
            crypto_amount,
            expires_at,
            callback_url: format!("{}/webhooks/{}", self.settings.public_base_url, request.rail),
        };
        let instructions = adapter.open_payment(&draft).await?;

        let confirmations_required =
            i32::try_from(adapter.required_confirmations(request.asset)).unwrap_or(i32::MAX);

        let invoice = Invoice {
            id: invoice_id,
            rail: request.rail,
            external_reference: instructions.external_reference,
            owner_account_id: request.account_id,
            requested_amount_usd: request.amount_usd,
            asset: request.asset,
            crypto_amount,
            exchange_rate,
            payment_target: instructions.payment_target,
            status: InvoiceStatus::Pending,
            confirmations_observed: 0,
            confirmations_required,
            created_at: now,
            expires_at,
            updated_at: now,
        };
        self.store.insert_invoice(&invoice).await?;

        info!(
            invoice = %invoice.id,
            account = %invoice.owner_account_id,
            rail = %invoice.rail,
            asset = %invoice.asset,
            amount_usd = %invoice.requested_amount_usd,
            "Invoice created"
        );

        Ok(InvoiceReceipt {
            invoice_id: invoice.id,
            rail: invoice.rail,
            asset: invoice.asset,
            external_reference: invoice.external_reference,
            payment_target: invoice.payment_target,
            crypto_amount: invoice.crypto_amount,
            exchange_rate: invoice.exchange_rate,
            confirmations_required: invoice.confirmations_required,
            expires_at: invoice.expires_at,
        })
    }

    /// Authenticate, normalize, admit and apply one webhook delivery
    pub async fn ingest_webhook(
        &self,
        rail: Rail,
        headers: &HeaderMap,
        body: &[u8],
    ) -> AppResult<WebhookAck> {
        let adapter = self.rails.get(rail)?;
        adapter.verify_signature(headers, body)?;

        let mut event = adapter.normalize(body)?;
        if !adapter.trusts_webhook_payload() {
            // unsigned notification: use it only to learn which payment to re-read
            debug!(rail = %rail, reference = %event.external_reference, "Re-reading unsigned notification");
            event = adapter.fetch_status(&event.external_reference).await?;
        }

        let report = self.apply_event(event).await?;
        Ok(WebhookAck {
            accepted: true,
            duplicate: report.duplicate,
            invoice_id: Some(report.invoice_id),
            status: Some(report.status),
        })
    }

    /// Shared path from an observed event to the ledger
    pub async fn apply_event(&self, event: SettlementEvent) -> AppResult<SettlementReport> {
        let invoice = self
            .store
            .find_invoice_by_reference(event.rail, &event.external_reference)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "invoice for {} reference {}",
                    event.rail, event.external_reference
                ))
            })?;

        if let Some(hint) = event.account_hint {
            if hint != invoice.owner_account_id {
                warn!(
                    invoice = %invoice.id,
                    claimed = %hint,
                    "Event names a different account than the invoice owner"
                );
                return Err(SettlementError::validation(format!(
                    "event account {} does not own invoice {}",
                    hint, invoice.id
                ))
                .into());
            }
        }

        let (dedup_key, admission) = self.gate.admit(&event).await?;
        let now = Utc::now();

        if admission == Admission::Duplicate {
            return self.sweep_duplicate(&invoice, &event, &dedup_key, now).await;
        }

        let decided = ConfirmationPolicy::evaluate(&event, &invoice, now);
        debug!(
            invoice = %invoice.id,
            observed = event.observed.as_str(),
            confirmations = event.confirmations,
            decided = %decided,
            ?admission,
            "Policy decision"
        );

        let outcome = match self.transition(&invoice, &event, decided, &dedup_key).await {
            Ok(outcome) => outcome,
            // the event is consumed; answering with the closed status stops redelivery
            Err(SettlementError::TerminalRailFailure { invoice_id, status }) => {
                return Ok(SettlementReport {
                    invoice_id,
                    status,
                    duplicate: false,
                    outcome: None,
                });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(SettlementReport {
            invoice_id: invoice.id,
            status: outcome.status(),
            duplicate: false,
            outcome: Some(outcome),
        })
    }

    /// A repeated event normally changes nothing, but an open invoice past its
    /// deadline still has to close, or a rail that keeps re-sending the same
    /// pending status would hold it open forever.
    async fn sweep_duplicate(
        &self,
        invoice: &Invoice,
        event: &SettlementEvent,
        dedup_key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementReport> {
        if invoice.is_open() && invoice.is_expired_at(now) {
            let decided = ConfirmationPolicy::evaluate(event, invoice, now);
            if decided == InvoiceStatus::Expired {
                let outcome = self
                    .transactor
                    .close(invoice.id, event, decided, dedup_key)
                    .await?;
                return Ok(SettlementReport {
                    invoice_id: invoice.id,
                    status: outcome.status(),
                    duplicate: true,
                    outcome: Some(outcome),
                });
            }
        }

        debug!(invoice = %invoice.id, "Duplicate event acknowledged");
        Ok(SettlementReport {
            invoice_id: invoice.id,
            status: invoice.status,
            duplicate: true,
            outcome: None,
        })
    }

    async fn transition(
        &self,
        invoice: &Invoice,
        event: &SettlementEvent,
        decided: InvoiceStatus,
        dedup_key: &str,
    ) -> Result<SettlementOutcome, SettlementError> {
        match decided {
            InvoiceStatus::Confirmed | InvoiceStatus::Credited => {
                self.transactor.settle(invoice.id, event, dedup_key).await
            }
            InvoiceStatus::Failed | InvoiceStatus::Expired => {
                self.transactor.close(invoice.id, event, decided, dedup_key).await
            }
            InvoiceStatus::Pending | InvoiceStatus::Partial => {
                self.transactor.advance(invoice.id, event, decided, dedup_key).await
            }
        }
    }

    /// Ask the rail directly and apply whatever it says
    pub async fn poll_invoice(
        &self,
        invoice: &Invoice,
        timeout: std::time::Duration,
    ) -> AppResult<SettlementReport> {
        let adapter = self.rails.get(invoice.rail)?;
        let fetched = match tokio::time::timeout(
            timeout,
            adapter.fetch_status(&invoice.external_reference),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SettlementError::transient(invoice.rail, "status fetch timed out").into()),
        };

        match fetched {
            Ok(event) => self.apply_event(event).await,
            Err(e) if invoice.is_open() && invoice.is_expired_at(Utc::now()) => {
                // the rail cannot be asked, but the deadline alone decides the outcome
                warn!(
                    invoice = %invoice.id,
                    rail = %invoice.rail,
                    "Status fetch failed past the invoice deadline, closing as expired: {}",
                    e
                );
                self.apply_event(Self::deadline_event(invoice)).await
            }
            Err(e) => Err(e),
        }
    }

    /// Observation standing in for a rail that went silent past the deadline.
    /// Its dedup key is fixed per invoice, so repeated cycles collapse at the gate.
    fn deadline_event(invoice: &Invoice) -> SettlementEvent {
        SettlementEvent {
            external_reference: invoice.external_reference.clone(),
            rail: invoice.rail,
            observed: ObservedStatus::Expired,
            raw_status: DEADLINE_STATUS.to_string(),
            amount_reported: None,
            confirmations: u32::try_from(invoice.confirmations_observed).unwrap_or(0),
            tx_hash: None,
            account_hint: None,
            asset: Some(invoice.asset),
        }
    }

    /// Next batch for the poller. Invoices never polled, then the least
    /// recently polled, so one that keeps failing cannot hold the batch.
    pub async fn next_poll_batch(&self, grace: Duration, limit: i64) -> AppResult<Vec<Invoice>> {
        let now = Utc::now();
        let invoices = self.store.list_open_invoices(now - grace, limit).await?;
        if !invoices.is_empty() {
            let ids: Vec<Uuid> = invoices.iter().map(|i| i.id).collect();
            self.store.mark_polled(&ids, now).await?;
        }
        Ok(invoices)
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> AppResult<Invoice> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("invoice {}", invoice_id)))
    }

    /// Current status plus confirmation progress
    pub async fn invoice_status(&self, invoice_id: Uuid) -> AppResult<(InvoiceStatus, i32, i32)> {
        let invoice = self.invoice(invoice_id).await?;
        Ok((
            invoice.status,
            invoice.confirmations_observed,
            invoice.confirmations_required,
        ))
    }

    pub async fn account_summary(&self, account_id: Uuid) -> AppResult<AccountSummary> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("account {}", account_id)))?;
        let transactions = self.store.list_transactions(account_id).await?;
        let reconciliation = AccountReconciliation::check(&account, &transactions);
        if !reconciliation.consistent {
            warn!(
                account = %account_id,
                balance = %reconciliation.balance,
                ledger = %reconciliation.completed_total,
                "Account balance disagrees with its ledger"
            );
        }
        Ok(AccountSummary {
            account,
            reconciliation,
        })
    }

    pub async fn account_transactions(&self, account_id: Uuid) -> AppResult<Vec<LedgerTransaction>> {
        if self.store.get_account(account_id).await?.is_none() {
            return Err(AppError::NotFound(format!("account {}", account_id)));
        }
        self.store.list_transactions(account_id).await
    }
}
