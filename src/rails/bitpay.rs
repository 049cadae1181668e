use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::traits::{
    fold_status_or_reject, parse_payload, PaymentDraft, PaymentInstructions, RailAdapter,
};
use super::{missing_credential, read_json, transient};
use crate::error::{AppResult, SettlementError};
use crate::ledger::models::{Asset, ObservedStatus, Rail, SettlementEvent};

const API_VERSION: &str = "2.0.0";

#[derive(Debug, Clone)]
pub struct BitPayConfig {
    pub api_url: String,
    pub token: Option<String>,
}

/// BitPay hosted-invoice rail.
///
/// IPNs carry no signature, so a webhook is only a trigger: the invoice is
/// re-read from the BitPay API before anything is applied. The owning account
/// rides along in `posData` as `{"accountId": "..."}`.
pub struct BitPayAdapter {
    config: BitPayConfig,
    client: reqwest::Client,
}

/// IPNs arrive either wrapped (`extendedNotifications`) or as the bare invoice
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Notification {
    Wrapped { data: BitPayInvoice },
    Bare(BitPayInvoice),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BitPayInvoice {
    id: String,
    status: String,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    pos_data: Option<String>,
    /// `false`, or a string such as `paidPartial` / `paidOver`
    #[serde(default)]
    exception_status: serde_json::Value,
    #[serde(default)]
    transaction_currency: Option<String>,
    #[serde(default)]
    confirmations: Option<u32>,
    #[serde(default)]
    transaction_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PosData {
    account_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct CreatedInvoice {
    id: String,
    url: String,
}

impl BitPayAdapter {
    pub fn new(config: BitPayConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn event_from_invoice(&self, invoice: BitPayInvoice) -> AppResult<SettlementEvent> {
        // "paid" means the full amount is seen but not yet confirmed to BitPay's speed policy
        let mut observed = if invoice.status.eq_ignore_ascii_case("paid") {
            ObservedStatus::Pending
        } else {
            fold_status_or_reject(Rail::Bitpay, &invoice.status)?
        };

        if invoice.exception_status.as_str() == Some("paidPartial")
            && matches!(observed, ObservedStatus::Pending | ObservedStatus::Confirmed)
        {
            observed = ObservedStatus::Partial;
        }

        let account_hint = match invoice.pos_data.as_deref() {
            Some(raw) => {
                let pos: PosData = serde_json::from_str(raw).map_err(|e| {
                    SettlementError::validation(format!("bitpay posData rejected: {}", e))
                })?;
                Some(pos.account_id)
            }
            None => None,
        };

        let asset = invoice
            .transaction_currency
            .as_deref()
            .and_then(|c| c.parse::<Asset>().ok());
        let confirmations = invoice.confirmations.unwrap_or(0);

        Ok(SettlementEvent {
            external_reference: invoice.id,
            rail: Rail::Bitpay,
            observed,
            raw_status: invoice.status,
            amount_reported: invoice.price,
            confirmations,
            tx_hash: invoice.transaction_hash,
            account_hint,
            asset,
        })
    }

    fn token(&self) -> AppResult<&str> {
        self.config
            .token
            .as_deref()
            .ok_or_else(|| missing_credential(Rail::Bitpay, "BITPAY_TOKEN"))
    }
}

#[async_trait]
impl RailAdapter for BitPayAdapter {
    fn rail(&self) -> Rail {
        Rail::Bitpay
    }

    fn supports_asset(&self, asset: Asset) -> bool {
        !asset.is_fiat()
    }

    fn required_confirmations(&self, asset: Asset) -> u32 {
        match asset {
            Asset::Btc | Asset::Ltc => 6,
            Asset::Eth | Asset::Usdt | Asset::Usdc => 12,
            Asset::Sol => 1,
            Asset::Usd => 0,
        }
    }

    fn trusts_webhook_payload(&self) -> bool {
        false
    }

    fn normalize(&self, payload: &[u8]) -> AppResult<SettlementEvent> {
        let invoice = match parse_payload::<Notification>(Rail::Bitpay, payload)? {
            Notification::Wrapped { data } => data,
            Notification::Bare(invoice) => invoice,
        };
        debug!(invoice = %invoice.id, status = %invoice.status, "Normalizing BitPay IPN");
        self.event_from_invoice(invoice)
    }

    async fn open_payment(&self, draft: &PaymentDraft) -> AppResult<PaymentInstructions> {
        let token = self.token()?;
        let pos_data = serde_json::json!({ "accountId": draft.account_id }).to_string();

        let body = serde_json::json!({
            "price": draft.amount_usd,
            "currency": "USD",
            "token": token,
            "posData": pos_data,
            "orderId": draft.invoice_id,
            "notificationURL": draft.callback_url,
            "extendedNotifications": true,
            "transactionSpeed": "high",
            "paymentCurrencies": [draft.asset.as_str()],
        });

        let response = self
            .client
            .post(format!("{}/invoices", self.config.api_url))
            .header("X-Accept-Version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| transient(Rail::Bitpay, e))?;

        let created: Envelope<CreatedInvoice> = read_json(Rail::Bitpay, response).await?;

        Ok(PaymentInstructions {
            external_reference: created.data.id,
            payment_target: created.data.url,
        })
    }

    async fn fetch_status(&self, external_reference: &str) -> AppResult<SettlementEvent> {
        let token = self.token()?;

        let response = self
            .client
            .get(format!("{}/invoices/{}", self.config.api_url, external_reference))
            .header("X-Accept-Version", API_VERSION)
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| transient(Rail::Bitpay, e))?;

        let envelope: Envelope<BitPayInvoice> = read_json(Rail::Bitpay, response).await?;
        self.event_from_invoice(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use rust_decimal_macros::dec;

    fn adapter() -> BitPayAdapter {
        BitPayAdapter::new(
            BitPayConfig {
                api_url: "http://127.0.0.1:9".into(),
                token: None,
            },
            reqwest::Client::new(),
        )
    }

    fn ipn(status: &str, exception: serde_json::Value, pos_data: &str) -> Vec<u8> {
        serde_json::json!({
            "event": {"code": 1005, "name": "invoice_confirmed"},
            "data": {
                "id": "KSnNNfoMDsbRzd1U9ypmVH",
                "status": status,
                "price": 5000,
                "currency": "USD",
                "posData": pos_data,
                "exceptionStatus": exception,
                "transactionCurrency": "BTC"
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_confirmed_ipn_extracts_account_from_pos_data() {
        let account = Uuid::new_v4();
        let pos = format!("{{\"accountId\":\"{}\"}}", account);
        let event = adapter()
            .normalize(&ipn("confirmed", serde_json::json!(false), &pos))
            .unwrap();

        assert_eq!(event.external_reference, "KSnNNfoMDsbRzd1U9ypmVH");
        assert_eq!(event.observed, ObservedStatus::Confirmed);
        assert_eq!(event.account_hint, Some(account));
        assert_eq!(event.asset, Some(Asset::Btc));
        assert_eq!(event.amount_reported, Some(dec!(5000)));
    }

    #[test]
    fn test_bare_invoice_payload() {
        let account = Uuid::new_v4();
        let payload = serde_json::json!({
            "id": "inv-1",
            "status": "new",
            "posData": format!("{{\"accountId\":\"{}\"}}", account),
        });
        let event = adapter().normalize(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.observed, ObservedStatus::Pending);
        assert_eq!(event.confirmations, 0);
    }

    #[test]
    fn test_paid_is_not_final() {
        let pos = format!("{{\"accountId\":\"{}\"}}", Uuid::new_v4());
        let event = adapter()
            .normalize(&ipn("paid", serde_json::json!(false), &pos))
            .unwrap();
        assert_eq!(event.observed, ObservedStatus::Pending);
    }

    #[test]
    fn test_partial_payment_exception() {
        let pos = format!("{{\"accountId\":\"{}\"}}", Uuid::new_v4());
        let event = adapter()
            .normalize(&ipn("paid", serde_json::json!("paidPartial"), &pos))
            .unwrap();
        assert_eq!(event.observed, ObservedStatus::Partial);
    }

    #[test]
    fn test_malformed_pos_data_rejected() {
        let err = adapter()
            .normalize(&ipn("confirmed", serde_json::json!(false), "account=42"))
            .unwrap_err();
        assert!(matches!(err, AppError::Settlement(SettlementError::Validation(_))));
    }

    #[test]
    fn test_confirmation_table() {
        let bitpay = adapter();
        assert_eq!(bitpay.required_confirmations(Asset::Btc), 6);
        assert_eq!(bitpay.required_confirmations(Asset::Ltc), 6);
        assert_eq!(bitpay.required_confirmations(Asset::Usdc), 12);
        assert_eq!(bitpay.required_confirmations(Asset::Sol), 1);
        assert!(!bitpay.supports_asset(Asset::Usd));
    }
}
