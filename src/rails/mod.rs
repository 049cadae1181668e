// Payment rail adapters - one per rail, all behind `RailAdapter`
pub mod bitpay;
pub mod card;
pub mod nowpayments;
pub mod reference;
pub mod registry;
pub mod signature;
pub mod traits;
pub mod wire;

pub use registry::RailRegistry;
pub use traits::{PaymentDraft, PaymentInstructions, RailAdapter};

use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::Rail;

/// HTTP client shared by a rail adapter; every outbound call is bounded by `timeout`
pub fn build_client(timeout: Duration) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))
}

pub(crate) fn transient(rail: Rail, error: reqwest::Error) -> AppError {
    let message = if error.is_timeout() {
        "request timed out".to_string()
    } else {
        error.to_string()
    };
    SettlementError::transient(rail, message).into()
}

/// Decode a rail response, treating any non-2xx as transient
pub(crate) async fn read_json<T: DeserializeOwned>(
    rail: Rail,
    response: reqwest::Response,
) -> AppResult<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(SettlementError::transient(rail, format!("HTTP {}", status)).into());
    }
    response.json::<T>().await.map_err(|e| transient(rail, e))
}

pub(crate) fn missing_credential(rail: Rail, name: &str) -> AppError {
    AppError::Config(format!("{} is not configured for rail {}", name, rail))
}
