use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use std::{str::FromStr, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    error::AppResult,
    ledger::models::{Asset, Rail},
    middleware::ValidatedJson,
    settlement::{NewInvoice, SettlementOrchestrator, WebhookAck},
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SettlementOrchestrator>,
}

/// POST /invoices - open a funding invoice on one rail
pub async fn create_invoice(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateInvoiceRequest>,
) -> AppResult<Json<CreateInvoiceResponse>> {
    let rail = Rail::from_str(&request.rail)?;
    let asset = Asset::from_str(&request.asset)?;

    info!(
        "Creating invoice: {} USD via {} ({}) for account {}",
        request.amount_usd, rail, asset, request.account_id
    );

    let receipt = state
        .orchestrator
        .create_invoice(NewInvoice {
            account_id: request.account_id,
            amount_usd: request.amount_usd,
            asset,
            rail,
        })
        .await?;

    Ok(Json(CreateInvoiceResponse::from(receipt)))
}

/// POST /webhooks/:rail - one handler for every rail; the adapter does the rest
///
/// 200 only once the delivery is durably admitted. Anything else makes the
/// rail redeliver.
pub async fn rail_webhook(
    State(state): State<AppState>,
    Path(rail): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let rail = Rail::from_str(&rail)?;
    info!("📬 Webhook received from {} ({} bytes)", rail, body.len());

    let ack = state
        .orchestrator
        .ingest_webhook(rail, &headers, &body)
        .await
        .map_err(|e| {
            warn!("Webhook from {} not accepted: {}", rail, e);
            e
        })?;

    Ok(Json(ack))
}

/// GET /invoices/:id/status
pub async fn get_invoice_status(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> AppResult<Json<InvoiceStatusResponse>> {
    let (status, confirmations, confirmations_required) =
        state.orchestrator.invoice_status(invoice_id).await?;

    Ok(Json(InvoiceStatusResponse {
        invoice_id,
        status,
        confirmations,
        confirmations_required,
    }))
}

/// GET /invoices/:id
pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> AppResult<Json<InvoiceResponse>> {
    let invoice = state.orchestrator.invoice(invoice_id).await?;
    Ok(Json(InvoiceResponse::from(invoice)))
}

/// GET /accounts/:id
pub async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> AppResult<Json<AccountResponse>> {
    let summary = state.orchestrator.account_summary(account_id).await?;
    Ok(Json(AccountResponse::from(summary)))
}

/// GET /accounts/:id/transactions
pub async fn get_account_transactions(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> AppResult<Json<Vec<TransactionResponse>>> {
    let transactions = state.orchestrator.account_transactions(account_id).await?;
    Ok(Json(
        transactions
            .into_iter()
            .map(TransactionResponse::from)
            .collect(),
    ))
}

/// GET /health - Health check
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let (status, store) = match state.orchestrator.health().await {
        Ok(backend) => ("healthy", backend.to_string()),
        Err(e) => {
            warn!("Ledger store health check failed: {}", e);
            ("degraded", "unreachable".to_string())
        }
    };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now(),
        store,
        rails: state.orchestrator.rails().rails(),
    }))
}
