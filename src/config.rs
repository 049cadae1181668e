use chrono::Duration;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

use crate::ledger::models::{Asset, Rail};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Absent -> in-memory ledger store (development only)
    pub database_url: Option<String>,
    pub bind_address: String,
    /// Base URL the rails call back into (`{base}/webhooks/{rail}`)
    pub public_base_url: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,

    pub min_invoice_usd: Decimal,
    pub card_expiry_hours: i64,
    pub bitpay_expiry_hours: i64,
    pub nowpayments_expiry_hours: i64,
    pub wire_expiry_hours: i64,

    pub poll_interval_secs: u64,
    pub poll_grace_secs: i64,
    pub poll_batch_limit: i64,
    pub poll_concurrency: usize,
    pub rail_timeout_secs: u64,

    pub card_api_url: String,
    pub card_secret_key: Option<String>,
    pub card_webhook_secret: Option<String>,

    pub bitpay_api_url: String,
    pub bitpay_token: Option<String>,

    pub nowpayments_api_url: String,
    pub nowpayments_api_key: Option<String>,
    pub nowpayments_ipn_secret: Option<String>,

    pub wire_api_url: Option<String>,
    pub wire_api_key: Option<String>,
    pub wire_webhook_secret: Option<String>,
    pub wire_instructions: String,

    pub rate_source_url: String,
    /// `BTC=65000,ETH=3200` - when set, replaces the HTTP rate source
    pub static_rates: Option<String>,

    /// Comma separated allowed origins, empty -> permissive
    pub cors_origins: Option<String>,
    pub webhook_rate_limit_per_minute: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(config::Environment::default().try_parsing(true))
    }

    pub fn from_source(env: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("public_base_url", "http://localhost:8080")?
            .set_default("db_max_connections", 50)?
            .set_default("db_min_connections", 5)?
            .set_default("min_invoice_usd", "100")?
            .set_default("card_expiry_hours", 24)?
            .set_default("bitpay_expiry_hours", 24)?
            .set_default("nowpayments_expiry_hours", 20)?
            .set_default("wire_expiry_hours", 24)?
            .set_default("poll_interval_secs", 90)?
            .set_default("poll_grace_secs", 120)?
            .set_default("poll_batch_limit", 100)?
            .set_default("poll_concurrency", 8)?
            .set_default("rail_timeout_secs", 10)?
            .set_default("card_api_url", "https://api.stripe.com")?
            .set_default("bitpay_api_url", "https://bitpay.com")?
            .set_default("nowpayments_api_url", "https://api.nowpayments.io")?
            .set_default("wire_instructions", "Wire to the settlement account quoting reference")?
            .set_default("rate_source_url", "https://api.coingecko.com/api/v3")?
            .set_default("webhook_rate_limit_per_minute", 600)?
            .add_source(env)
            .build()?
            .try_deserialize()
    }

    pub fn expiry_for(&self, rail: Rail) -> Duration {
        let hours = match rail {
            Rail::Card => self.card_expiry_hours,
            Rail::Bitpay => self.bitpay_expiry_hours,
            Rail::Nowpayments => self.nowpayments_expiry_hours,
            Rail::Wire => self.wire_expiry_hours,
        };
        Duration::hours(hours)
    }

    pub fn rail_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.rail_timeout_secs)
    }

    /// Parse `STATIC_RATES`, skipping malformed pairs
    pub fn static_rate_table(&self) -> Option<HashMap<Asset, Decimal>> {
        let raw = self.static_rates.as_ref()?;
        let table = raw
            .split(',')
            .filter_map(|pair| {
                let (asset, rate) = pair.split_once('=')?;
                let asset = Asset::from_str(asset.trim()).ok()?;
                let rate = Decimal::from_str(rate.trim()).ok()?;
                Some((asset, rate))
            })
            .collect();
        Some(table)
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}
