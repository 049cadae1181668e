use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::signature::{header_str, require_secret, verify_sha256};
use super::traits::{fold_status_or_reject, parse_payload, PaymentDraft, PaymentInstructions, RailAdapter};
use super::{missing_credential, read_json, transient};
use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::{Asset, ObservedStatus, Rail, SettlementEvent};

const SIGNATURE_HEADER: &str = "stripe-signature";
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct CardConfig {
    pub api_url: String,
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
}

/// Card processor rail. Settlement is binary: an intent either succeeded or it did not.
pub struct CardAdapter {
    config: CardConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CardEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: CardEventData,
}

#[derive(Debug, Deserialize)]
struct CardEventData {
    object: PaymentIntent,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    latest_charge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedIntent {
    id: String,
    client_secret: String,
}

impl CardAdapter {
    pub fn new(config: CardConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn event_from_intent(&self, intent: PaymentIntent, failed_event: bool) -> AppResult<SettlementEvent> {
        let observed = if failed_event {
            ObservedStatus::Failed
        } else {
            fold_status_or_reject(Rail::Card, &intent.status)?
        };

        let account_hint = match intent.metadata.get("account_id") {
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| {
                SettlementError::validation(format!("card metadata account_id '{}' is not a UUID", raw))
            })?),
            None => None,
        };

        Ok(SettlementEvent {
            external_reference: intent.id,
            rail: Rail::Card,
            observed,
            raw_status: intent.status,
            amount_reported: intent.amount_received.map(|cents| Decimal::new(cents, 2)),
            confirmations: 0,
            tx_hash: intent.latest_charge,
            account_hint,
            asset: Some(Asset::Usd),
        })
    }
}

/// `t=<unix>,v1=<hex>[,v1=<hex>...]` over `"{t}.{body}"`
fn verify_card_signature(secret: &str, header: &str, body: &[u8], now: i64) -> bool {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return false;
    };
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return false;
    }

    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(body);
    candidates
        .iter()
        .any(|candidate| verify_sha256(secret, &signed, candidate))
}

#[async_trait]
impl RailAdapter for CardAdapter {
    fn rail(&self) -> Rail {
        Rail::Card
    }

    fn supports_asset(&self, asset: Asset) -> bool {
        asset == Asset::Usd
    }

    fn required_confirmations(&self, _asset: Asset) -> u32 {
        0
    }

    fn verify_signature(&self, headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
        let secret = require_secret(Rail::Card, self.config.webhook_secret.as_deref())?;
        let header = header_str(headers, SIGNATURE_HEADER).ok_or(AppError::InvalidSignature(Rail::Card))?;
        if verify_card_signature(secret, header, body, Utc::now().timestamp()) {
            Ok(())
        } else {
            warn!("Rejected card webhook with bad signature");
            Err(AppError::InvalidSignature(Rail::Card))
        }
    }

    fn normalize(&self, payload: &[u8]) -> AppResult<SettlementEvent> {
        let event: CardEvent = parse_payload(Rail::Card, payload)?;
        debug!(event_type = %event.event_type, "Normalizing card event");
        let failed_event = event.event_type == "payment_intent.payment_failed";
        self.event_from_intent(event.data.object, failed_event)
    }

    async fn open_payment(&self, draft: &PaymentDraft) -> AppResult<PaymentInstructions> {
        let secret_key = self
            .config
            .secret_key
            .as_deref()
            .ok_or_else(|| missing_credential(Rail::Card, "CARD_SECRET_KEY"))?;

        let cents = (draft.amount_usd * Decimal::ONE_HUNDRED)
            .round()
            .to_i64()
            .ok_or_else(|| AppError::BadRequest("amount out of range".to_string()))?;

        let form = [
            ("amount", cents.to_string()),
            ("currency", "usd".to_string()),
            ("metadata[account_id]", draft.account_id.to_string()),
            ("metadata[invoice_id]", draft.invoice_id.to_string()),
        ];

        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.config.api_url))
            .bearer_auth(secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| transient(Rail::Card, e))?;

        let created: CreatedIntent = read_json(Rail::Card, response).await?;

        Ok(PaymentInstructions {
            external_reference: created.id,
            payment_target: created.client_secret,
        })
    }

    async fn fetch_status(&self, external_reference: &str) -> AppResult<SettlementEvent> {
        let secret_key = self
            .config
            .secret_key
            .as_deref()
            .ok_or_else(|| missing_credential(Rail::Card, "CARD_SECRET_KEY"))?;

        let response = self
            .client
            .get(format!("{}/v1/payment_intents/{}", self.config.api_url, external_reference))
            .bearer_auth(secret_key)
            .send()
            .await
            .map_err(|e| transient(Rail::Card, e))?;

        let intent: PaymentIntent = read_json(Rail::Card, response).await?;
        self.event_from_intent(intent, false)
    }
}
