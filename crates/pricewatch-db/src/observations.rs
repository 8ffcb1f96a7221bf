//! Database operations for `price_observations`.

use chrono::{DateTime, Utc};
use pricewatch_core::PriceObservation;
use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::PgPool;
use uuid::Uuid;

use crate::DbError;

/// Largest magnitude a `NUMERIC(12,2)` column accepts.
const MAX_AMOUNT: f64 = 9_999_999_999.99;

/// A row from the `price_observations` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PriceObservationRow {
    pub id: i64,
    pub public_id: Uuid,
    pub product_name: String,
    pub region_token: Option<String>,
    /// `NULL` when the token did not resolve to a canonical code.
    pub region: Option<String>,
    pub amount: Decimal,
    pub currency_code: String,
    pub period: String,
    pub plan_name: String,
    pub source_url: String,
    pub success: bool,
    pub notes: Option<String>,
    pub fetch_tier: Option<String>,
    pub extraction_tier: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Convert a scraped `f64` amount to the stored two-decimal form.
///
/// # Errors
///
/// Returns [`DbError::InvalidAmount`] for negative, non-finite or
/// out-of-range amounts.
pub fn amount_to_decimal(amount: f64) -> Result<Decimal, DbError> {
    if !amount.is_finite() || amount < 0.0 || amount > MAX_AMOUNT {
        return Err(DbError::InvalidAmount(amount));
    }
    Decimal::try_from(amount)
        .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
        .map_err(|_| DbError::InvalidAmount(amount))
}

/// Append one observation. Every call inserts a new row; no dedup.
///
/// Returns the internal `id` of the inserted row.
///
/// # Errors
///
/// Returns [`DbError::InvalidAmount`] if the amount cannot be stored, or
/// [`DbError::Sqlx`] if the insert fails.
pub async fn insert_price_observation(
    pool: &PgPool,
    observation: &PriceObservation,
) -> Result<i64, DbError> {
    let amount = amount_to_decimal(observation.amount)?;

    let id: i64 = sqlx::query_scalar::<_, i64>(
        "INSERT INTO price_observations \
             (public_id, product_name, region_token, region, amount, currency_code, \
              period, plan_name, source_url, success, notes, fetch_tier, \
              extraction_tier, observed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, \
                 $7, $8, $9, $10, $11, $12, \
                 $13, $14) \
         RETURNING id",
    )
    .bind(observation.id)
    .bind(&observation.product_name)
    .bind(&observation.region_token)
    .bind(&observation.region)
    .bind(amount)
    .bind(&observation.currency)
    .bind(&observation.period)
    .bind(&observation.plan_name)
    .bind(&observation.source_url)
    .bind(observation.success)
    .bind(&observation.notes)
    .bind(observation.fetch_tier.map(|t| t.as_str()))
    .bind(observation.extraction_tier.map(|t| t.as_str()))
    .bind(observation.observed_at)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Most recent observations, newest first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_recent_observations(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<PriceObservationRow>, DbError> {
    let rows = sqlx::query_as::<_, PriceObservationRow>(
        "SELECT id, public_id, product_name, region_token, region, amount, currency_code, \
                period, plan_name, source_url, success, notes, fetch_tier, \
                extraction_tier, observed_at, created_at \
         FROM price_observations \
         ORDER BY observed_at DESC, id DESC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
