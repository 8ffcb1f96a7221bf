//! Observation sinks: Postgres for real runs, a logging sink for `--dry-run`.

use async_trait::async_trait;
use pricewatch_core::PriceObservation;
use pricewatch_scraper::{ObservationSink, PersistenceError};

pub(crate) struct PgSink {
    pool: sqlx::PgPool,
}

impl PgSink {
    pub(crate) fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ObservationSink for PgSink {
    async fn record(&self, observation: &PriceObservation) -> Result<(), PersistenceError> {
        let id = pricewatch_db::insert_price_observation(&self.pool, observation)
            .await
            .map_err(|e| PersistenceError::new(e.to_string()))?;
        tracing::debug!(id, product = %observation.product_name, "observation stored");
        Ok(())
    }
}

/// Prints the insert it would make and never touches the database.
pub(crate) struct DryRunSink;

#[async_trait]
impl ObservationSink for DryRunSink {
    async fn record(&self, observation: &PriceObservation) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(observation)
            .map_err(|e| PersistenceError::new(format!("cannot serialize observation: {e}")))?;
        tracing::info!(product = %observation.product_name, "dry-run: skipping insert");
        println!("dry-run: would insert {json}");
        Ok(())
    }
}
