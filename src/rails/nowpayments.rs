use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::reference::OrderReference;
use super::signature::{header_str, require_secret, verify_sha512};
use super::traits::{
    fold_status_or_reject, parse_payload, PaymentDraft, PaymentInstructions, RailAdapter,
};
use super::{missing_credential, read_json, transient};
use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::{Asset, Rail, SettlementEvent};

const SIGNATURE_HEADER: &str = "x-nowpayments-sig";

#[derive(Debug, Clone)]
pub struct NowPaymentsConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub ipn_secret: Option<String>,
}

/// NOWPayments crypto rail. The owning account is embedded in `order_id`.
pub struct NowPaymentsAdapter {
    config: NowPaymentsConfig,
    client: reqwest::Client,
}

/// NOWPayments sends numeric ids in IPNs and strings from some endpoints
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PaymentId {
    Number(u64),
    Text(String),
}

impl PaymentId {
    fn into_string(self) -> String {
        match self {
            PaymentId::Number(n) => n.to_string(),
            PaymentId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PaymentStatus {
    payment_id: PaymentId,
    payment_status: String,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    actually_paid: Option<Decimal>,
    #[serde(default)]
    pay_currency: Option<String>,
    #[serde(default)]
    payin_hash: Option<String>,
    #[serde(default)]
    confirmations: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CreatedPayment {
    payment_id: PaymentId,
    pay_address: String,
}

/// Re-serialize with keys sorted at every depth; the IPN signature is computed over this form
fn sorted_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), sorted_json(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_json).collect()),
        other => other.clone(),
    }
}

pub fn canonical_body(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    serde_json::to_string(&sorted_json(&value)).ok()
}

impl NowPaymentsAdapter {
    pub fn new(config: NowPaymentsConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn event_from_status(&self, status: PaymentStatus) -> AppResult<SettlementEvent> {
        let observed = fold_status_or_reject(Rail::Nowpayments, &status.payment_status)?;

        let order_id = status
            .order_id
            .as_deref()
            .ok_or_else(|| SettlementError::validation("nowpayments payment has no order_id"))?;
        let reference = OrderReference::parse(order_id)?;

        let asset = status
            .pay_currency
            .as_deref()
            .and_then(|c| c.parse::<Asset>().ok());

        Ok(SettlementEvent {
            external_reference: status.payment_id.into_string(),
            rail: Rail::Nowpayments,
            observed,
            raw_status: status.payment_status,
            amount_reported: status.actually_paid,
            confirmations: status.confirmations.unwrap_or(0),
            tx_hash: status.payin_hash,
            account_hint: Some(reference.account_id),
            asset,
        })
    }

    fn api_key(&self) -> AppResult<&str> {
        self.config
            .api_key
            .as_deref()
            .ok_or_else(|| missing_credential(Rail::Nowpayments, "NOWPAYMENTS_API_KEY"))
    }
}

#[async_trait]
impl RailAdapter for NowPaymentsAdapter {
    fn rail(&self) -> Rail {
        Rail::Nowpayments
    }

    fn supports_asset(&self, asset: Asset) -> bool {
        !asset.is_fiat()
    }

    fn required_confirmations(&self, asset: Asset) -> u32 {
        match asset {
            Asset::Btc | Asset::Ltc => 3,
            Asset::Eth | Asset::Usdt | Asset::Usdc => 12,
            Asset::Sol => 1,
            Asset::Usd => 0,
        }
    }

    fn verify_signature(&self, headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
        let secret = require_secret(Rail::Nowpayments, self.config.ipn_secret.as_deref())?;
        let signature = header_str(headers, SIGNATURE_HEADER)
            .ok_or(AppError::InvalidSignature(Rail::Nowpayments))?;
        let canonical =
            canonical_body(body).ok_or(AppError::InvalidSignature(Rail::Nowpayments))?;

        if verify_sha512(secret, canonical.as_bytes(), signature) {
            Ok(())
        } else {
            warn!("Rejected NOWPayments IPN with bad signature");
            Err(AppError::InvalidSignature(Rail::Nowpayments))
        }
    }

    fn normalize(&self, payload: &[u8]) -> AppResult<SettlementEvent> {
        let status: PaymentStatus = parse_payload(Rail::Nowpayments, payload)?;
        debug!(status = %status.payment_status, "Normalizing NOWPayments IPN");
        self.event_from_status(status)
    }

    async fn open_payment(&self, draft: &PaymentDraft) -> AppResult<PaymentInstructions> {
        let api_key = self.api_key()?;
        let order_id = OrderReference::new(draft.account_id, Utc::now());

        let body = serde_json::json!({
            "price_amount": draft.amount_usd,
            "price_currency": "usd",
            "pay_currency": draft.asset.as_str().to_ascii_lowercase(),
            "order_id": order_id.to_string(),
            "order_description": format!("Invoice {}", draft.invoice_id),
            "ipn_callback_url": draft.callback_url,
        });

        let response = self
            .client
            .post(format!("{}/v1/payment", self.config.api_url))
            .header("x-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transient(Rail::Nowpayments, e))?;

        let created: CreatedPayment = read_json(Rail::Nowpayments, response).await?;

        Ok(PaymentInstructions {
            external_reference: created.payment_id.into_string(),
            payment_target: created.pay_address,
        })
    }

    async fn fetch_status(&self, external_reference: &str) -> AppResult<SettlementEvent> {
        let api_key = self.api_key()?;

        let response = self
            .client
            .get(format!("{}/v1/payment/{}", self.config.api_url, external_reference))
            .header("x-api-key", api_key)
            .send()
            .await
            .map_err(|e| transient(Rail::Nowpayments, e))?;

        let status: PaymentStatus = read_json(Rail::Nowpayments, response).await?;
        self.event_from_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::ObservedStatus;
    use crate::rails::signature::sign_sha512;
    use axum::http::HeaderValue;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn adapter(ipn_secret: Option<&str>) -> NowPaymentsAdapter {
        NowPaymentsAdapter::new(
            NowPaymentsConfig {
                api_url: "http://127.0.0.1:9".into(),
                api_key: None,
                ipn_secret: ipn_secret.map(str::to_string),
            },
            reqwest::Client::new(),
        )
    }

    fn ipn(status: &str, order_id: &str, confirmations: Option<u32>) -> Vec<u8> {
        let mut body = serde_json::json!({
            "payment_id": 5077125051u64,
            "payment_status": status,
            "pay_address": "bc1qexample",
            "price_amount": 5000,
            "price_currency": "usd",
            "pay_amount": 0.0743,
            "actually_paid": 0.0743,
            "pay_currency": "btc",
            "order_id": order_id,
            "payin_hash": "9f2c",
        });
        if let Some(c) = confirmations {
            body["confirmations"] = serde_json::json!(c);
        }
        body.to_string().into_bytes()
    }

    #[test]
    fn test_confirming_ipn_carries_account_and_count() {
        let account = Uuid::new_v4();
        let order = OrderReference::new(account, Utc::now()).to_string();
        let event = adapter(None).normalize(&ipn("confirming", &order, Some(2))).unwrap();

        assert_eq!(event.external_reference, "5077125051");
        assert_eq!(event.observed, ObservedStatus::Pending);
        assert_eq!(event.confirmations, 2);
        assert_eq!(event.account_hint, Some(account));
        assert_eq!(event.asset, Some(Asset::Btc));
        assert_eq!(event.amount_reported, Some(dec!(0.0743)));
    }

    #[test]
    fn test_finished_keeps_reported_count() {
        let order = OrderReference::new(Uuid::new_v4(), Utc::now()).to_string();
        let event = adapter(None).normalize(&ipn("finished", &order, None)).unwrap();
        assert_eq!(event.observed, ObservedStatus::Confirmed);
        // the invoice's own threshold is applied by the policy
        assert_eq!(event.confirmations, 0);
    }

    #[test]
    fn test_partially_paid() {
        let order = OrderReference::new(Uuid::new_v4(), Utc::now()).to_string();
        let event = adapter(None).normalize(&ipn("partially_paid", &order, Some(1))).unwrap();
        assert_eq!(event.observed, ObservedStatus::Partial);
    }

    #[test]
    fn test_malformed_order_id_rejected() {
        for order in ["GMC-user42-1700000000000", "order-1", ""] {
            let err = adapter(None).normalize(&ipn("finished", order, None)).unwrap_err();
            assert!(
                matches!(err, AppError::Settlement(SettlementError::Validation(_))),
                "accepted {:?}",
                order
            );
        }
    }

    #[test]
    fn test_canonical_body_sorts_keys() {
        let canonical = canonical_body(br#"{"b":1,"a":{"d":2,"c":3}}"#).unwrap();
        assert_eq!(canonical, r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_signature_over_sorted_body() {
        let np = adapter(Some("ipn-secret"));
        let order = OrderReference::new(Uuid::new_v4(), Utc::now()).to_string();
        let body = ipn("finished", &order, None);
        let sig = sign_sha512("ipn-secret", canonical_body(&body).unwrap().as_bytes()).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sig).unwrap());
        assert!(np.verify_signature(&headers, &body).is_ok());

        let tampered = ipn("finished", &OrderReference::new(Uuid::new_v4(), Utc::now()).to_string(), None);
        assert!(matches!(
            np.verify_signature(&headers, &tampered),
            Err(AppError::InvalidSignature(Rail::Nowpayments))
        ));
    }

    #[test]
    fn test_unsigned_ipn_refused_without_secret() {
        let order = OrderReference::new(Uuid::new_v4(), Utc::now()).to_string();
        let body = ipn("finished", &order, None);
        assert!(matches!(
            adapter(None).verify_signature(&HeaderMap::new(), &body),
            Err(AppError::InvalidSignature(Rail::Nowpayments))
        ));
    }
}
