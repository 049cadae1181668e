use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::bitpay::{BitPayAdapter, BitPayConfig};
use super::card::{CardAdapter, CardConfig};
use super::nowpayments::{NowPaymentsAdapter, NowPaymentsConfig};
use super::traits::RailAdapter;
use super::wire::{WireAdapter, WireConfig};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::ledger::models::Rail;

pub struct RailRegistry {
    adapters: HashMap<Rail, Arc<dyn RailAdapter>>,
}

impl RailRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// All four rails wired from configuration, sharing one HTTP client
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let client = super::build_client(config.rail_timeout())?;
        let mut registry = Self::new();

        for (rail, secret) in [
            (Rail::Card, &config.card_webhook_secret),
            (Rail::Nowpayments, &config.nowpayments_ipn_secret),
            (Rail::Wire, &config.wire_webhook_secret),
        ] {
            if secret.as_deref().map_or(true, str::is_empty) {
                warn!("⚠️  No webhook secret for {} - its webhooks will be rejected", rail);
            }
        }

        registry.register(Arc::new(CardAdapter::new(
            CardConfig {
                api_url: config.card_api_url.clone(),
                secret_key: config.card_secret_key.clone(),
                webhook_secret: config.card_webhook_secret.clone(),
            },
            client.clone(),
        )));
        registry.register(Arc::new(BitPayAdapter::new(
            BitPayConfig {
                api_url: config.bitpay_api_url.clone(),
                token: config.bitpay_token.clone(),
            },
            client.clone(),
        )));
        registry.register(Arc::new(NowPaymentsAdapter::new(
            NowPaymentsConfig {
                api_url: config.nowpayments_api_url.clone(),
                api_key: config.nowpayments_api_key.clone(),
                ipn_secret: config.nowpayments_ipn_secret.clone(),
            },
            client.clone(),
        )));
        registry.register(Arc::new(WireAdapter::new(
            WireConfig {
                api_url: config.wire_api_url.clone(),
                api_key: config.wire_api_key.clone(),
                webhook_secret: config.wire_webhook_secret.clone(),
                instructions: config.wire_instructions.clone(),
            },
            client,
        )));

        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn RailAdapter>) {
        info!("Registering rail adapter: {}", adapter.rail());
        self.adapters.insert(adapter.rail(), adapter);
    }

    pub fn get(&self, rail: Rail) -> AppResult<Arc<dyn RailAdapter>> {
        self.adapters
            .get(&rail)
            .cloned()
            .ok_or_else(|| AppError::BadRequest(format!("Rail {} is not enabled", rail)))
    }

    pub fn rails(&self) -> Vec<Rail> {
        let mut rails: Vec<Rail> = self.adapters.keys().copied().collect();
        rails.sort_by_key(|r| r.as_str());
        rails
    }
}

impl Default for RailRegistry {
    fn default() -> Self {
        Self::new()
    }
}
