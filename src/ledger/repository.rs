use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::{duplicate_invoice, LedgerStore, LedgerUnit};
use crate::error::{AppError, AppResult};

const INVOICE_COLUMNS: &str = r#"
    id, rail, external_reference, owner_account_id, requested_amount_usd, asset,
    crypto_amount, exchange_rate, payment_target, status, confirmations_observed,
    confirmations_required, created_at, expires_at, updated_at
"#;

const ACCOUNT_COLUMNS: &str = r#"
    id, balance, available_balance, total_deposits, total_withdrawals, created_at, updated_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, account_id, invoice_id, kind, rail, amount_usd, status, external_reference,
    created_at, metadata
"#;

/// Ledger repository backed by Postgres
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_big(value: Decimal) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| AppError::Internal(format!("Decimal conversion failed: {}", e)))
}

fn from_big(value: &BigDecimal) -> AppResult<Decimal> {
    let text = value.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(AppError::from)
}

fn decimal_column(row: &PgRow, column: &str) -> AppResult<Decimal> {
    let value: BigDecimal = row.try_get(column)?;
    from_big(&value)
}

fn optional_decimal_column(row: &PgRow, column: &str) -> AppResult<Option<Decimal>> {
    let value: Option<BigDecimal> = row.try_get(column)?;
    value.as_ref().map(from_big).transpose()
}

/// A second invoice for the same rail reference is a caller error, not a database fault
fn insert_invoice_error(error: sqlx::Error, invoice: &Invoice) -> AppError {
    if let sqlx::Error::Database(db) = &error {
        if db.is_unique_violation() {
            return duplicate_invoice(invoice);
        }
    }
    AppError::Database(error)
}

fn account_from_row(row: &PgRow) -> AppResult<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        balance: decimal_column(row, "balance")?,
        available_balance: decimal_column(row, "available_balance")?,
        total_deposits: decimal_column(row, "total_deposits")?,
        total_withdrawals: decimal_column(row, "total_withdrawals")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn invoice_from_row(row: &PgRow) -> AppResult<Invoice> {
    Ok(Invoice {
        id: row.try_get("id")?,
        rail: row.try_get("rail")?,
        external_reference: row.try_get("external_reference")?,
        owner_account_id: row.try_get("owner_account_id")?,
        requested_amount_usd: decimal_column(row, "requested_amount_usd")?,
        asset: row.try_get("asset")?,
        crypto_amount: optional_decimal_column(row, "crypto_amount")?,
        exchange_rate: optional_decimal_column(row, "exchange_rate")?,
        payment_target: row.try_get("payment_target")?,
        status: row.try_get("status")?,
        confirmations_observed: row.try_get("confirmations_observed")?,
        confirmations_required: row.try_get("confirmations_required")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> AppResult<LedgerTransaction> {
    Ok(LedgerTransaction {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        invoice_id: row.try_get("invoice_id")?,
        kind: row.try_get("kind")?,
        rail: row.try_get("rail")?,
        amount_usd: decimal_column(row, "amount_usd")?,
        status: row.try_get("status")?,
        external_reference: row.try_get("external_reference")?,
        created_at: row.try_get("created_at")?,
        metadata: row.try_get("metadata")?,
    })
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ========== ACCOUNT OPERATIONS ==========

    async fn ensure_account(&self, account_id: Uuid) -> AppResult<Account> {
        sqlx::query("INSERT INTO accounts (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        self.get_account(account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("account {}", account_id)))
    }

    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    // ========== INVOICE OPERATIONS ==========

    async fn insert_invoice(&self, invoice: &Invoice) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, rail, external_reference, owner_account_id, requested_amount_usd, asset,
                crypto_amount, exchange_rate, payment_target, status, confirmations_observed,
                confirmations_required, created_at, expires_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.rail)
        .bind(&invoice.external_reference)
        .bind(invoice.owner_account_id)
        .bind(to_big(invoice.requested_amount_usd)?)
        .bind(invoice.asset)
        .bind(invoice.crypto_amount.map(to_big).transpose()?)
        .bind(invoice.exchange_rate.map(to_big).transpose()?)
        .bind(&invoice.payment_target)
        .bind(invoice.status)
        .bind(invoice.confirmations_observed)
        .bind(invoice.confirmations_required)
        .bind(invoice.created_at)
        .bind(invoice.expires_at)
        .bind(invoice.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_invoice_error(e, invoice))?;

        Ok(())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> AppResult<Option<Invoice>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM invoices WHERE id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn find_invoice_by_reference(
        &self,
        rail: Rail,
        external_reference: &str,
    ) -> AppResult<Option<Invoice>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM invoices WHERE rail = $1 AND external_reference = $2",
            INVOICE_COLUMNS
        ))
        .bind(rail)
        .bind(external_reference)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn list_open_invoices(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Invoice>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM invoices
            WHERE status IN ('pending', 'partial', 'confirmed') AND created_at < $1
            ORDER BY last_polled_at ASC NULLS FIRST, created_at ASC
            LIMIT $2
            "#,
            INVOICE_COLUMNS
        ))
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(invoice_from_row).collect()
    }

    async fn mark_polled(&self, invoice_ids: &[Uuid], at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE invoices SET last_polled_at = $2 WHERE id = ANY($1)")
            .bind(invoice_ids)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_transactions(&self, account_id: Uuid) -> AppResult<Vec<LedgerTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_transactions WHERE account_id = $1 ORDER BY created_at ASC",
            TRANSACTION_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transaction_from_row).collect()
    }

    // ========== IDEMPOTENCY ==========

    async fn insert_idempotency_record(&self, record: &IdempotencyRecord) -> AppResult<Admission> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (dedup_key, rail, external_reference, processed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(&record.dedup_key)
        .bind(record.rail)
        .bind(&record.external_reference)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(Admission::New);
        }

        let applied: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT applied_at FROM idempotency_records WHERE dedup_key = $1",
        )
        .bind(&record.dedup_key)
        .fetch_one(&self.pool)
        .await?;

        debug!(dedup_key = %record.dedup_key, applied = applied.is_some(), "dedup key already present");

        Ok(match applied {
            Some(_) => Admission::Duplicate,
            None => Admission::Unapplied,
        })
    }

    async fn begin(&self) -> AppResult<Box<dyn LedgerUnit>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerUnit { tx }))
    }
}

/// Postgres transaction wrapper. Row locks taken here are held until commit.
pub struct PgLedgerUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerUnit for PgLedgerUnit {
    async fn lock_invoice(&mut self, invoice_id: Uuid) -> AppResult<Invoice> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM invoices WHERE id = $1 FOR UPDATE",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("invoice {}", invoice_id)))?;

        invoice_from_row(&row)
    }

    async fn credit_account(&mut self, account_id: Uuid, amount: Decimal) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + $2,
                available_balance = available_balance + $2,
                total_deposits = total_deposits + $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(to_big(amount)?)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("account {}", account_id)));
        }

        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &LedgerTransaction) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_transactions (
                id, account_id, invoice_id, kind, rail, amount_usd, status,
                external_reference, created_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.account_id)
        .bind(transaction.invoice_id)
        .bind(transaction.kind)
        .bind(transaction.rail)
        .bind(to_big(transaction.amount_usd)?)
        .bind(transaction.status)
        .bind(&transaction.external_reference)
        .bind(transaction.created_at)
        .bind(&transaction.metadata)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn update_invoice(
        &mut self,
        invoice_id: Uuid,
        status: InvoiceStatus,
        confirmations: i32,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2,
                confirmations_observed = GREATEST(confirmations_observed, $3),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .bind(status)
        .bind(confirmations)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn mark_applied(&mut self, dedup_key: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE idempotency_records SET applied_at = NOW() WHERE dedup_key = $1 AND applied_at IS NULL",
        )
        .bind(dedup_key)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
