// USD exchange rates used when an invoice is priced in crypto
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::ledger::models::Asset;

/// Decimal places kept on asset-denominated invoice amounts
pub const CRYPTO_AMOUNT_DP: u32 = 8;

/// One rate observation. Taken once at invoice creation and carried with
/// the invoice; nothing re-reads it afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct RateSnapshot {
    pub asset: Asset,
    pub usd_per_unit: Decimal,
    pub taken_at: DateTime<Utc>,
}

impl RateSnapshot {
    pub fn usd() -> Self {
        Self {
            asset: Asset::Usd,
            usd_per_unit: Decimal::ONE,
            taken_at: Utc::now(),
        }
    }

    /// Asset amount that covers `amount_usd` at this rate
    pub fn convert(&self, amount_usd: Decimal) -> AppResult<Decimal> {
        if self.usd_per_unit <= Decimal::ZERO {
            return Err(AppError::ExternalError(format!(
                "Non-positive {} rate {}",
                self.asset, self.usd_per_unit
            )));
        }
        let amount = amount_usd
            .checked_div(self.usd_per_unit)
            .ok_or_else(|| AppError::Internal("rate conversion overflow".to_string()))?;
        Ok(amount.round_dp(CRYPTO_AMOUNT_DP))
    }
}

#[async_trait]
pub trait RateSource: Send + Sync {
    async fn snapshot(&self, asset: Asset) -> AppResult<RateSnapshot>;
}

/// CoinGecko-style `simple/price` endpoint
pub struct HttpRateSource {
    client: Client,
    base_url: String,
}

impl HttpRateSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn coin_id(asset: Asset) -> Option<&'static str> {
        match asset {
            Asset::Btc => Some("bitcoin"),
            Asset::Eth => Some("ethereum"),
            Asset::Usdt => Some("tether"),
            Asset::Usdc => Some("usd-coin"),
            Asset::Sol => Some("solana"),
            Asset::Ltc => Some("litecoin"),
            Asset::Usd => None,
        }
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn snapshot(&self, asset: Asset) -> AppResult<RateSnapshot> {
        let Some(coin) = Self::coin_id(asset) else {
            return Ok(RateSnapshot::usd());
        };

        let url = format!("{}/simple/price", self.base_url);
        debug!("Fetching {} rate from {}", asset, url);

        let response = self
            .client
            .get(&url)
            .query(&[("ids", coin), ("vs_currencies", "usd")])
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("Rate source returned {} for {}", response.status(), asset);
            return Err(AppError::ExternalError(format!(
                "Rate source returned {}",
                response.status()
            )));
        }

        let body: HashMap<String, HashMap<String, Decimal>> = response.json().await?;
        let usd_per_unit = body
            .get(coin)
            .and_then(|quotes| quotes.get("usd"))
            .copied()
            .ok_or_else(|| AppError::ExternalError(format!("No USD quote for {}", asset)))?;

        Ok(RateSnapshot {
            asset,
            usd_per_unit,
            taken_at: Utc::now(),
        })
    }
}

/// Fixed table, for development and tests
pub struct StaticRateSource {
    rates: HashMap<Asset, Decimal>,
}

impl StaticRateSource {
    pub fn new(rates: HashMap<Asset, Decimal>) -> Self {
        Self { rates }
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    async fn snapshot(&self, asset: Asset) -> AppResult<RateSnapshot> {
        if asset.is_fiat() {
            return Ok(RateSnapshot::usd());
        }
        let usd_per_unit = self
            .rates
            .get(&asset)
            .copied()
            .ok_or_else(|| AppError::ExternalError(format!("No static rate for {}", asset)))?;
        Ok(RateSnapshot {
            asset,
            usd_per_unit,
            taken_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_static_source_and_conversion() {
        let source = StaticRateSource::new(HashMap::from([(Asset::Btc, dec!(65000))]));
        let snapshot = source.snapshot(Asset::Btc).await.unwrap();
        // 5000 / 65000 = 0.076923076923... -> 8 dp
        assert_eq!(snapshot.convert(dec!(5000)).unwrap(), dec!(0.07692308));

        assert!(source.snapshot(Asset::Eth).await.is_err());
        assert_eq!(source.snapshot(Asset::Usd).await.unwrap().usd_per_unit, Decimal::ONE);
    }

    #[test]
    fn test_zero_rate_rejected() {
        let snapshot = RateSnapshot {
            asset: Asset::Sol,
            usd_per_unit: Decimal::ZERO,
            taken_at: Utc::now(),
        };
        assert!(snapshot.convert(dec!(100)).is_err());
    }
}
