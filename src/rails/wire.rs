use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use super::reference::OrderReference;
use super::signature::{header_str, require_secret, verify_sha256};
use super::traits::{fold_status_or_reject, parse_payload, PaymentDraft, PaymentInstructions, RailAdapter};
use super::{read_json, transient};
use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::{Asset, Rail, SettlementEvent};

const SIGNATURE_HEADER: &str = "x-wire-signature";

#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Bank status API; without it wire invoices settle by webhook only
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub instructions: String,
}

/// Bank wire rail. Binary settlement; the payer quotes a `GMC-` reference in the memo.
pub struct WireAdapter {
    config: WireConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WireNotice {
    reference: String,
    status: String,
    #[serde(default)]
    amount: Option<Decimal>,
    #[serde(default)]
    transfer_id: Option<String>,
}

impl WireAdapter {
    pub fn new(config: WireConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn event_from_notice(&self, notice: WireNotice) -> AppResult<SettlementEvent> {
        let observed = fold_status_or_reject(Rail::Wire, &notice.status)?;
        let reference = OrderReference::parse(&notice.reference)?;

        Ok(SettlementEvent {
            external_reference: notice.reference,
            rail: Rail::Wire,
            observed,
            raw_status: notice.status,
            amount_reported: notice.amount,
            confirmations: 0,
            tx_hash: notice.transfer_id,
            account_hint: Some(reference.account_id),
            asset: Some(Asset::Usd),
        })
    }
}

#[async_trait]
impl RailAdapter for WireAdapter {
    fn rail(&self) -> Rail {
        Rail::Wire
    }

    fn supports_asset(&self, asset: Asset) -> bool {
        asset.is_fiat()
    }

    fn required_confirmations(&self, _asset: Asset) -> u32 {
        0
    }

    fn verify_signature(&self, headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
        let secret = require_secret(Rail::Wire, self.config.webhook_secret.as_deref())?;
        let signature =
            header_str(headers, SIGNATURE_HEADER).ok_or(AppError::InvalidSignature(Rail::Wire))?;
        if verify_sha256(secret, body, signature) {
            Ok(())
        } else {
            warn!("Rejected wire notice with bad signature");
            Err(AppError::InvalidSignature(Rail::Wire))
        }
    }

    fn normalize(&self, payload: &[u8]) -> AppResult<SettlementEvent> {
        let notice: WireNotice = parse_payload(Rail::Wire, payload)?;
        debug!(reference = %notice.reference, status = %notice.status, "Normalizing wire notice");
        self.event_from_notice(notice)
    }

    async fn open_payment(&self, draft: &PaymentDraft) -> AppResult<PaymentInstructions> {
        let reference = OrderReference::new(draft.account_id, Utc::now()).to_string();
        Ok(PaymentInstructions {
            payment_target: format!("{} Reference: {}", self.config.instructions, reference),
            external_reference: reference,
        })
    }

    async fn fetch_status(&self, external_reference: &str) -> AppResult<SettlementEvent> {
        let Some(api_url) = self.config.api_url.as_deref() else {
            return Err(SettlementError::transient(Rail::Wire, "no wire status API configured").into());
        };

        let mut request = self
            .client
            .get(format!("{}/transfers/{}", api_url, external_reference));
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| transient(Rail::Wire, e))?;
        let notice: WireNotice = read_json(Rail::Wire, response).await?;
        self.event_from_notice(notice)
    }
}
