//! Postgres-backed ledger
//!
//! Schema lives in `migrations/`. Refund reservation runs in one transaction
//! with the parent intent row locked `FOR UPDATE`. Transfer reservation and
//! webhook events lean on unique keys with `ON CONFLICT DO NOTHING`.

use super::{check_refund, Ledger, LedgerError, LedgerResult, TransferClaim};
use crate::config::DatabaseConfig;
use crate::payments::types::{
    CurrencyCode, DeferredPaymentOffer, PaymentIntent, PaymentStatus, Rail, Refund,
    RefundSplit, RefundStatus, Transfer, VendorSplit,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::QueryAs;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub async fn init_pool(config: &DatabaseConfig) -> LedgerResult<PgPool> {
    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Initializing ledger database pool"
    );

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout))
        .connect(&config.url)
        .await
        .map_err(storage)
}

fn storage(err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

/// Parse a snake_case enum column through its serde representation.
fn parse_enum<T: DeserializeOwned>(column: &str, value: &str) -> LedgerResult<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| LedgerError::Storage(format!("unexpected {} value: {}", column, value)))
}

fn parse_currency(value: &str) -> LedgerResult<CurrencyCode> {
    CurrencyCode::parse(value).map_err(|e| LedgerError::Storage(e.to_string()))
}

const INTENT_COLUMNS: &str = "id, amount_minor, currency, rail, status, provider_reference, \
     client_action_token, redirect_url, captured_amount, splits, deferred_payment, \
     idempotency_key, metadata, created_at, expires_at, updated_at";

const REFUND_COLUMNS: &str = "id, payment_intent_id, rail, amount_minor, currency, status, \
     reason, splits, provider_reference, created_at, updated_at";

const TRANSFER_COLUMNS: &str = "id, payment_intent_id, vendor_id, rail, amount_minor, currency, \
     status, transfer_reference, dedupe_key, service_type, attempts, failure_reason, \
     outcome_unknown, batch_key, batch_platform_fee, created_at, updated_at";

const TRANSFER_VALUES: &str =
    "$1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17";

#[derive(Debug, FromRow)]
struct IntentRow {
    id: Uuid,
    amount_minor: i64,
    currency: String,
    rail: String,
    status: String,
    provider_reference: String,
    client_action_token: Option<String>,
    redirect_url: Option<String>,
    captured_amount: Option<i64>,
    splits: Json<Vec<VendorSplit>>,
    deferred_payment: Option<Json<DeferredPaymentOffer>>,
    idempotency_key: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IntentRow> for PaymentIntent {
    type Error = LedgerError;

    fn try_from(row: IntentRow) -> LedgerResult<Self> {
        Ok(PaymentIntent {
            id: row.id,
            amount_minor: row.amount_minor,
            currency: parse_currency(&row.currency)?,
            rail: parse_enum("rail", &row.rail)?,
            status: PaymentStatus::from_db_status(&row.status)
                .ok_or_else(|| LedgerError::Storage(format!("unexpected status {}", row.status)))?,
            provider_reference: row.provider_reference,
            client_action_token: row.client_action_token,
            redirect_url: row.redirect_url,
            captured_amount: row.captured_amount,
            splits: row.splits.0,
            deferred_payment: row.deferred_payment.map(|d| d.0),
            idempotency_key: row.idempotency_key,
            metadata: row.metadata,
            created_at: row.created_at,
            expires_at: row.expires_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RefundRow {
    id: Uuid,
    payment_intent_id: Uuid,
    rail: String,
    amount_minor: i64,
    currency: String,
    status: String,
    reason: String,
    splits: Json<Vec<RefundSplit>>,
    provider_reference: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = LedgerError;

    fn try_from(row: RefundRow) -> LedgerResult<Self> {
        Ok(Refund {
            id: row.id,
            payment_intent_id: row.payment_intent_id,
            rail: parse_enum("rail", &row.rail)?,
            amount_minor: row.amount_minor,
            currency: parse_currency(&row.currency)?,
            status: RefundStatus::from_db_status(&row.status)
                .ok_or_else(|| LedgerError::Storage(format!("unexpected status {}", row.status)))?,
            reason: parse_enum("reason", &row.reason)?,
            splits: row.splits.0,
            provider_reference: row.provider_reference,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransferRow {
    id: Uuid,
    payment_intent_id: Uuid,
    vendor_id: String,
    rail: String,
    amount_minor: i64,
    currency: String,
    status: String,
    transfer_reference: Option<String>,
    dedupe_key: String,
    service_type: String,
    attempts: i32,
    failure_reason: Option<String>,
    outcome_unknown: bool,
    batch_key: Option<String>,
    batch_platform_fee: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransferRow> for Transfer {
    type Error = LedgerError;

    fn try_from(row: TransferRow) -> LedgerResult<Self> {
        Ok(Transfer {
            id: row.id,
            payment_intent_id: row.payment_intent_id,
            vendor_id: row.vendor_id,
            rail: parse_enum("rail", &row.rail)?,
            amount_minor: row.amount_minor,
            currency: parse_currency(&row.currency)?,
            status: parse_enum("status", &row.status)?,
            transfer_reference: row.transfer_reference,
            dedupe_key: row.dedupe_key,
            service_type: parse_enum("service_type", &row.service_type)?,
            attempts: row.attempts.max(0) as u32,
            failure_reason: row.failure_reason,
            outcome_unknown: row.outcome_unknown,
            batch_key: row.batch_key,
            batch_platform_fee: row.batch_platform_fee,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn bind_transfer<'q>(
    query: QueryAs<'q, Postgres, TransferRow, PgArguments>,
    transfer: &'q Transfer,
) -> QueryAs<'q, Postgres, TransferRow, PgArguments> {
    query
        .bind(transfer.id)
        .bind(transfer.payment_intent_id)
        .bind(&transfer.vendor_id)
        .bind(transfer.rail.as_str())
        .bind(transfer.amount_minor)
        .bind(transfer.currency.as_str())
        .bind(transfer.status.as_str())
        .bind(&transfer.transfer_reference)
        .bind(&transfer.dedupe_key)
        .bind(transfer.service_type.as_str())
        .bind(transfer.attempts as i32)
        .bind(&transfer.failure_reason)
        .bind(transfer.outcome_unknown)
        .bind(&transfer.batch_key)
        .bind(transfer.batch_platform_fee)
        .bind(transfer.created_at)
        .bind(transfer.updated_at)
}

fn collect<R, T>(rows: Vec<R>) -> LedgerResult<Vec<T>>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn insert_intent(&self, intent: PaymentIntent) -> LedgerResult<PaymentIntent> {
        let sql = format!(
            "INSERT INTO payment_intents ({INTENT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             RETURNING {INTENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(intent.id)
            .bind(intent.amount_minor)
            .bind(intent.currency.as_str())
            .bind(intent.rail.as_str())
            .bind(intent.status.as_str())
            .bind(&intent.provider_reference)
            .bind(&intent.client_action_token)
            .bind(&intent.redirect_url)
            .bind(intent.captured_amount)
            .bind(Json(&intent.splits))
            .bind(intent.deferred_payment.as_ref().map(Json))
            .bind(&intent.idempotency_key)
            .bind(&intent.metadata)
            .bind(intent.created_at)
            .bind(intent.expires_at)
            .bind(intent.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                let duplicate =
                    matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
                if duplicate {
                    LedgerError::DuplicateIdempotencyKey(
                        intent.idempotency_key.clone().unwrap_or_default(),
                    )
                } else {
                    storage(e)
                }
            })?;
        row.try_into()
    }

    async fn get_intent(&self, id: Uuid) -> LedgerResult<Option<PaymentIntent>> {
        let sql = format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE id = $1");
        sqlx::query_as::<_, IntentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(PaymentIntent::try_from)
            .transpose()
    }

    async fn find_intent_by_idempotency_key(
        &self,
        key: &str,
    ) -> LedgerResult<Option<PaymentIntent>> {
        let sql =
            format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE idempotency_key = $1");
        sqlx::query_as::<_, IntentRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(PaymentIntent::try_from)
            .transpose()
    }

    async fn find_intent_by_reference(
        &self,
        rail: Rail,
        reference: &str,
    ) -> LedgerResult<Option<PaymentIntent>> {
        let sql = format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents
             WHERE rail = $1 AND provider_reference = $2"
        );
        sqlx::query_as::<_, IntentRow>(&sql)
            .bind(rail.as_str())
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(PaymentIntent::try_from)
            .transpose()
    }

    async fn transition_intent(
        &self,
        id: Uuid,
        to: PaymentStatus,
        captured_amount: Option<i64>,
    ) -> LedgerResult<PaymentIntent> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let sql = format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE id = $1 FOR UPDATE");
        let current: PaymentIntent = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or(LedgerError::IntentNotFound(id))?
            .try_into()?;

        if !current.status.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition {
                from: current.status,
                to,
            });
        }
        let captured = if to == PaymentStatus::Captured && current.captured_amount.is_none() {
            Some(captured_amount.unwrap_or(current.amount_minor))
        } else {
            current.captured_amount
        };

        let sql = format!(
            "UPDATE payment_intents
             SET status = $2, captured_amount = $3, updated_at = NOW()
             WHERE id = $1
             RETURNING {INTENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(id)
            .bind(to.as_str())
            .bind(captured)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        row.try_into()
    }

    async fn reserve_refund(&self, refund: Refund) -> LedgerResult<Refund> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let sql = format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE id = $1 FOR UPDATE");
        let intent: PaymentIntent = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(refund.payment_intent_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or(LedgerError::IntentNotFound(refund.payment_intent_id))?
            .try_into()?;

        let sql = format!("SELECT {REFUND_COLUMNS} FROM refunds WHERE payment_intent_id = $1");
        let prior: Vec<Refund> = collect(
            sqlx::query_as::<_, RefundRow>(&sql)
                .bind(refund.payment_intent_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(storage)?,
        )?;

        check_refund(&intent, &prior, &refund)?;

        let sql = format!(
            "INSERT INTO refunds ({REFUND_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING {REFUND_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RefundRow>(&sql)
            .bind(refund.id)
            .bind(refund.payment_intent_id)
            .bind(refund.rail.as_str())
            .bind(refund.amount_minor)
            .bind(refund.currency.as_str())
            .bind(refund.status.as_str())
            .bind(refund.reason.as_str())
            .bind(Json(&refund.splits))
            .bind(&refund.provider_reference)
            .bind(refund.created_at)
            .bind(refund.updated_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        row.try_into()
    }

    async fn update_refund(
        &self,
        id: Uuid,
        status: RefundStatus,
        provider_reference: Option<String>,
    ) -> LedgerResult<Refund> {
        let sql = format!(
            "UPDATE refunds
             SET status = $2,
                 provider_reference = COALESCE($3, provider_reference),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {REFUND_COLUMNS}"
        );
        sqlx::query_as::<_, RefundRow>(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(provider_reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(LedgerError::RefundNotFound(id))?
            .try_into()
    }

    async fn find_refund_by_reference(
        &self,
        rail: Rail,
        reference: &str,
    ) -> LedgerResult<Option<Refund>> {
        let sql = format!(
            "SELECT {REFUND_COLUMNS} FROM refunds WHERE rail = $1 AND provider_reference = $2"
        );
        sqlx::query_as::<_, RefundRow>(&sql)
            .bind(rail.as_str())
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(Refund::try_from)
            .transpose()
    }

    async fn refunds_for(&self, payment_intent_id: Uuid) -> LedgerResult<Vec<Refund>> {
        let sql = format!(
            "SELECT {REFUND_COLUMNS} FROM refunds WHERE payment_intent_id = $1 ORDER BY created_at"
        );
        collect(
            sqlx::query_as::<_, RefundRow>(&sql)
                .bind(payment_intent_id)
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?,
        )
    }

    async fn unacknowledged_refunds(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<Refund>> {
        let sql = format!(
            "SELECT {REFUND_COLUMNS} FROM refunds
             WHERE status = 'pending' AND provider_reference IS NULL AND updated_at < $1
             ORDER BY updated_at
             LIMIT $2"
        );
        collect(
            sqlx::query_as::<_, RefundRow>(&sql)
                .bind(before)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?,
        )
    }

    async fn reserve_transfers(&self, transfers: Vec<Transfer>) -> LedgerResult<Vec<TransferClaim>> {
        let insert = format!(
            "INSERT INTO transfers ({TRANSFER_COLUMNS})
             VALUES ({TRANSFER_VALUES})
             ON CONFLICT (payment_intent_id, vendor_id) DO NOTHING
             RETURNING {TRANSFER_COLUMNS}"
        );
        let existing = format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE payment_intent_id = $1 AND vendor_id = $2"
        );

        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut claims = Vec::with_capacity(transfers.len());
        for transfer in &transfers {
            let inserted = bind_transfer(sqlx::query_as::<_, TransferRow>(&insert), transfer)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage)?;
            let claim = match inserted {
                Some(row) => TransferClaim::Claimed(row.try_into()?),
                None => TransferClaim::Held(
                    sqlx::query_as::<_, TransferRow>(&existing)
                        .bind(transfer.payment_intent_id)
                        .bind(&transfer.vendor_id)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(storage)?
                        .try_into()?,
                ),
            };
            claims.push(claim);
        }
        tx.commit().await.map_err(storage)?;
        Ok(claims)
    }

    async fn claim_transfer(&self, id: Uuid, attempts: u32) -> LedgerResult<TransferClaim> {
        let sql = format!(
            "UPDATE transfers
             SET status = 'pending', updated_at = NOW()
             WHERE id = $1 AND status = 'failed' AND attempts = $2
             RETURNING {TRANSFER_COLUMNS}"
        );
        let claimed = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(id)
            .bind(attempts as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        match claimed {
            Some(row) => Ok(TransferClaim::Claimed(row.try_into()?)),
            None => self
                .get_transfer(id)
                .await?
                .map(TransferClaim::Held)
                .ok_or(LedgerError::TransferNotFound(id)),
        }
    }

    async fn upsert_transfer(&self, transfer: Transfer) -> LedgerResult<Transfer> {
        let sql = format!(
            "INSERT INTO transfers ({TRANSFER_COLUMNS})
             VALUES ({TRANSFER_VALUES})
             ON CONFLICT (id) DO UPDATE SET
                 status = EXCLUDED.status,
                 transfer_reference = EXCLUDED.transfer_reference,
                 dedupe_key = EXCLUDED.dedupe_key,
                 attempts = EXCLUDED.attempts,
                 failure_reason = EXCLUDED.failure_reason,
                 outcome_unknown = EXCLUDED.outcome_unknown,
                 batch_key = EXCLUDED.batch_key,
                 batch_platform_fee = EXCLUDED.batch_platform_fee,
                 updated_at = EXCLUDED.updated_at
             RETURNING {TRANSFER_COLUMNS}"
        );
        bind_transfer(sqlx::query_as::<_, TransferRow>(&sql), &transfer)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?
            .try_into()
    }

    async fn get_transfer(&self, id: Uuid) -> LedgerResult<Option<Transfer>> {
        let sql = format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1");
        sqlx::query_as::<_, TransferRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(Transfer::try_from)
            .transpose()
    }

    async fn find_transfers_by_reference(
        &self,
        rail: Rail,
        reference: &str,
    ) -> LedgerResult<Vec<Transfer>> {
        let sql = format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE rail = $1 AND transfer_reference = $2"
        );
        collect(
            sqlx::query_as::<_, TransferRow>(&sql)
                .bind(rail.as_str())
                .bind(reference)
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?,
        )
    }

    async fn transfers_for(&self, payment_intent_id: Uuid) -> LedgerResult<Vec<Transfer>> {
        let sql = format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE payment_intent_id = $1 ORDER BY vendor_id"
        );
        collect(
            sqlx::query_as::<_, TransferRow>(&sql)
                .bind(payment_intent_id)
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?,
        )
    }

    async fn failed_transfers(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> LedgerResult<Vec<Transfer>> {
        let sql = format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE status = 'failed' AND attempts < $1
               AND payment_intent_id IN (SELECT id FROM payment_intents WHERE status = 'captured')
             ORDER BY updated_at
             LIMIT $2"
        );
        collect(
            sqlx::query_as::<_, TransferRow>(&sql)
                .bind(max_attempts as i32)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?,
        )
    }

    async fn record_event(&self, rail: Rail, event_id: &str) -> LedgerResult<bool> {
        let result = sqlx::query(
            "INSERT INTO webhook_events (rail, event_id) VALUES ($1, $2)
             ON CONFLICT (rail, event_id) DO NOTHING",
        )
        .bind(rail.as_str())
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_event(&self, rail: Rail, event_id: &str) -> LedgerResult<()> {
        sqlx::query("DELETE FROM webhook_events WHERE rail = $1 AND event_id = $2")
            .bind(rail.as_str())
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}
