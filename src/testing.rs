// Shared fixtures for unit tests
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppResult, SettlementError};
use crate::ledger::models::{Asset, Invoice, InvoiceStatus, ObservedStatus, Rail, SettlementEvent};
use crate::ledger::{LedgerStore, MemoryLedgerStore};
use crate::rails::nowpayments::{NowPaymentsAdapter, NowPaymentsConfig};
use crate::rails::reference::OrderReference;
use crate::rails::traits::fold_status;
use crate::rails::{PaymentDraft, PaymentInstructions, RailAdapter, RailRegistry};
use crate::rates::StaticRateSource;
use crate::settlement::{InvoiceSettings, SettlementOrchestrator};

/// NOWPayments stand-in: real payload normalization, scripted `fetch_status`
/// and no network.
pub struct FakeRail {
    inner: NowPaymentsAdapter,
    statuses: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<bool>,
    next_id: AtomicU64,
}

impl FakeRail {
    pub fn new() -> Self {
        Self {
            inner: NowPaymentsAdapter::new(
                NowPaymentsConfig {
                    api_url: "http://127.0.0.1:9".into(),
                    api_key: None,
                    ipn_secret: None,
                },
                reqwest::Client::new(),
            ),
            statuses: Mutex::new(HashMap::new()),
            failing: Mutex::new(false),
            next_id: AtomicU64::new(5_077_125_000),
        }
    }

    /// IPN body as NOWPayments would post it
    pub fn ipn(&self, reference: &str, account: Uuid, status: &str, confirmations: Option<u32>) -> Vec<u8> {
        let mut body = serde_json::json!({
            "payment_id": reference,
            "payment_status": status,
            "pay_currency": "btc",
            "actually_paid": 0.07692308,
            "order_id": OrderReference::new(account, Utc::now()).to_string(),
        });
        if let Some(c) = confirmations {
            body["confirmations"] = serde_json::json!(c);
        }
        body.to_string().into_bytes()
    }

    /// What the next `fetch_status` for `reference` reports
    pub fn set_status(&self, reference: &str, account: Uuid, status: &str, confirmations: u32) {
        let body = self.ipn(reference, account, status, Some(confirmations));
        self.statuses.lock().insert(reference.to_string(), body);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl RailAdapter for FakeRail {
    fn rail(&self) -> Rail {
        Rail::Nowpayments
    }

    fn supports_asset(&self, asset: Asset) -> bool {
        self.inner.supports_asset(asset)
    }

    fn required_confirmations(&self, asset: Asset) -> u32 {
        self.inner.required_confirmations(asset)
    }

    // signatures are covered by the adapter tests; the fake accepts every delivery
    fn verify_signature(&self, _headers: &HeaderMap, _body: &[u8]) -> AppResult<()> {
        Ok(())
    }

    fn normalize(&self, payload: &[u8]) -> AppResult<SettlementEvent> {
        self.inner.normalize(payload)
    }

    async fn open_payment(&self, _draft: &PaymentDraft) -> AppResult<PaymentInstructions> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentInstructions {
            external_reference: id.to_string(),
            payment_target: format!("bc1qfake{}", id),
        })
    }

    async fn fetch_status(&self, external_reference: &str) -> AppResult<SettlementEvent> {
        if *self.failing.lock() {
            return Err(SettlementError::transient(Rail::Nowpayments, "HTTP 503 Service Unavailable").into());
        }
        let body = self.statuses.lock().get(external_reference).cloned();
        match body {
            Some(body) => self.inner.normalize(&body),
            None => Err(SettlementError::transient(Rail::Nowpayments, "HTTP 404 Not Found").into()),
        }
    }
}

/// Real adapter for signatures and payloads, scripted answer for `fetch_status`
pub struct ScriptedRail {
    inner: Arc<dyn RailAdapter>,
    statuses: Mutex<HashMap<String, Vec<u8>>>,
}

impl ScriptedRail {
    pub fn new(inner: Arc<dyn RailAdapter>) -> Self {
        Self {
            inner,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Body the rail's API returns for `reference`, in the adapter's own payload shape
    pub fn script(&self, reference: &str, body: serde_json::Value) {
        self.statuses
            .lock()
            .insert(reference.to_string(), body.to_string().into_bytes());
    }
}

#[async_trait]
impl RailAdapter for ScriptedRail {
    fn rail(&self) -> Rail {
        self.inner.rail()
    }

    fn supports_asset(&self, asset: Asset) -> bool {
        self.inner.supports_asset(asset)
    }

    fn required_confirmations(&self, asset: Asset) -> u32 {
        self.inner.required_confirmations(asset)
    }

    fn trusts_webhook_payload(&self) -> bool {
        self.inner.trusts_webhook_payload()
    }

    fn verify_signature(&self, headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
        self.inner.verify_signature(headers, body)
    }

    fn normalize(&self, payload: &[u8]) -> AppResult<SettlementEvent> {
        self.inner.normalize(payload)
    }

    async fn open_payment(&self, draft: &PaymentDraft) -> AppResult<PaymentInstructions> {
        self.inner.open_payment(draft).await
    }

    async fn fetch_status(&self, external_reference: &str) -> AppResult<SettlementEvent> {
        let body = self.statuses.lock().get(external_reference).cloned();
        match body {
            Some(body) => self.inner.normalize(&body),
            None => Err(SettlementError::transient(self.rail(), "HTTP 404 Not Found").into()),
        }
    }
}

pub fn test_config() -> Config {
    Config::from_source(::config::Environment::default().source(Some(HashMap::new())))
        .expect("default config")
}

pub fn orchestrator(store: Arc<MemoryLedgerStore>, rail: Arc<FakeRail>) -> SettlementOrchestrator {
    orchestrator_with(store, vec![rail as Arc<dyn RailAdapter>])
}

pub fn orchestrator_with(
    store: Arc<MemoryLedgerStore>,
    adapters: Vec<Arc<dyn RailAdapter>>,
) -> SettlementOrchestrator {
    let mut registry = RailRegistry::new();
    for adapter in adapters {
        registry.register(adapter);
    }
    let rates = StaticRateSource::new(HashMap::from([(Asset::Btc, dec!(65000))]));
    SettlementOrchestrator::new(
        store,
        Arc::new(registry),
        Arc::new(rates),
        InvoiceSettings::from_config(&test_config()),
    )
}

pub async fn seed_invoice(
    store: &Arc<MemoryLedgerStore>,
    rail: Rail,
    amount_usd: Decimal,
    required: i32,
) -> Invoice {
    let account = Uuid::new_v4();
    let mut invoice = invoice_for(account, Duration::hours(20));
    invoice.rail = rail;
    invoice.requested_amount_usd = amount_usd;
    invoice.confirmations_required = required;
    store.ensure_account(account).await.unwrap();
    store.insert_invoice(&invoice).await.unwrap();
    invoice
}

/// USD card invoice; card settlement needs no confirmations
pub async fn seed_card_invoice(store: &Arc<MemoryLedgerStore>, amount_usd: Decimal) -> Invoice {
    let account = Uuid::new_v4();
    let mut invoice = invoice_for(account, Duration::hours(1));
    invoice.rail = Rail::Card;
    invoice.external_reference = format!("pi_{}", Uuid::new_v4().simple());
    invoice.asset = Asset::Usd;
    invoice.crypto_amount = None;
    invoice.exchange_rate = None;
    invoice.requested_amount_usd = amount_usd;
    invoice.confirmations_required = 0;
    store.ensure_account(account).await.unwrap();
    store.insert_invoice(&invoice).await.unwrap();
    invoice
}

/// BTC invoice on NOWPayments expiring `expires_in` from now
pub async fn seed_invoice_expiring(
    store: &Arc<MemoryLedgerStore>,
    account: Uuid,
    expires_in: Duration,
) -> Invoice {
    let invoice = invoice_for(account, expires_in);
    store.ensure_account(account).await.unwrap();
    store.insert_invoice(&invoice).await.unwrap();
    invoice
}

pub async fn seed_expired_invoice(store: &Arc<MemoryLedgerStore>, account: Uuid) -> Invoice {
    seed_invoice_expiring(store, account, Duration::hours(-1)).await
}

fn invoice_for(account: Uuid, expires_in: Duration) -> Invoice {
    let now = Utc::now();
    Invoice {
        id: Uuid::new_v4(),
        rail: Rail::Nowpayments,
        external_reference: Uuid::new_v4().simple().to_string(),
        owner_account_id: account,
        requested_amount_usd: dec!(500),
        asset: Asset::Btc,
        crypto_amount: Some(dec!(0.00769231)),
        exchange_rate: Some(dec!(65000)),
        payment_target: "bc1qfixture".into(),
        status: InvoiceStatus::Pending,
        confirmations_observed: 0,
        confirmations_required: 3,
        created_at: now - Duration::hours(2),
        expires_at: now + expires_in,
        updated_at: now,
    }
}

pub fn event_for(invoice: &Invoice, raw_status: &str, confirmations: u32) -> SettlementEvent {
    SettlementEvent {
        external_reference: invoice.external_reference.clone(),
        rail: invoice.rail,
        observed: fold_status(raw_status).unwrap_or(ObservedStatus::Pending),
        raw_status: raw_status.to_string(),
        amount_reported: None,
        confirmations,
        tx_hash: None,
        account_hint: Some(invoice.owner_account_id),
        asset: Some(invoice.asset),
    }
}
