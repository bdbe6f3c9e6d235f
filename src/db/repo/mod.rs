//! Repository layer for database operations.
//!
//! `Repository` is the SQLite-backed `SnapshotStore`. Methods are organized
//! across submodules by record kind:
//! - `prices.rs` - Price snapshot operations
//! - `portfolio.rs` - Historical portfolio snapshot operations
//!
//! Engine state (watermarks, last composition) lives here.

mod portfolio;
mod prices;

use crate::domain::{HistoricalPortfolioSnapshot, PriceSnapshot, RecordId, Stored, Symbol};
use crate::store::{
    PortfolioFilter, PortfolioQuery, PortfolioUpdate, PriceFilter, PriceQuery, PriceUpdate,
    SnapshotStore, StoreError,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::warn;

/// Encode an id list as a JSON array for `json_each`.
pub(crate) fn ids_json(ids: Option<&[RecordId]>) -> Option<String> {
    ids.map(|ids| {
        let parts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        format!("[{}]", parts.join(","))
    })
}

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    // =========================================================================
    // Engine state operations
    // =========================================================================

    /// Read an engine state value.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_state(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query("SELECT value FROM engine_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    /// Upsert an engine state value.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn put_state(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO engine_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove an engine state value.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn remove_state(&self, key: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM engine_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for Repository {
    async fn save_prices(&self, snapshots: &[PriceSnapshot]) -> Result<Vec<RecordId>, StoreError> {
        Ok(self.insert_prices(snapshots).await?)
    }

    async fn fetch_prices(
        &self,
        query: &PriceQuery,
    ) -> Result<Vec<Stored<PriceSnapshot>>, StoreError> {
        Ok(self.query_prices(query).await?)
    }

    async fn count_prices(&self, filter: &PriceFilter) -> Result<usize, StoreError> {
        Ok(self.count_prices_matching(filter).await?)
    }

    async fn delete_prices(&self, filter: &PriceFilter) -> Result<usize, StoreError> {
        Ok(self.delete_prices_matching(filter).await?)
    }

    async fn update_prices(
        &self,
        filter: &PriceFilter,
        update: &PriceUpdate,
    ) -> Result<usize, StoreError> {
        Ok(self.update_prices_matching(filter, update).await?)
    }

    async fn price_symbols(&self) -> Result<Vec<Symbol>, StoreError> {
        Ok(self.query_price_symbols().await?)
    }

    async fn price_days(&self, filter: &PriceFilter) -> Result<Vec<NaiveDate>, StoreError> {
        Ok(self.query_price_days(filter).await?)
    }

    async fn save_portfolio_snapshots(
        &self,
        snapshots: &[HistoricalPortfolioSnapshot],
    ) -> Result<Vec<RecordId>, StoreError> {
        self.insert_portfolio_snapshots(snapshots).await
    }

    async fn fetch_portfolio_snapshots(
        &self,
        query: &PortfolioQuery,
    ) -> Result<Vec<Stored<HistoricalPortfolioSnapshot>>, StoreError> {
        Ok(self.query_portfolio_snapshots(query).await?)
    }

    async fn count_portfolio_snapshots(
        &self,
        filter: &PortfolioFilter,
    ) -> Result<usize, StoreError> {
        Ok(self.count_portfolio_matching(filter).await?)
    }

    async fn delete_portfolio_snapshots(
        &self,
        filter: &PortfolioFilter,
    ) -> Result<usize, StoreError> {
        Ok(self.delete_portfolio_matching(filter).await?)
    }

    async fn update_portfolio_snapshots(
        &self,
        filter: &PortfolioFilter,
        update: &PortfolioUpdate,
    ) -> Result<usize, StoreError> {
        Ok(self.update_portfolio_matching(filter, update).await?)
    }

    async fn load_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get_state(key).await?)
    }

    async fn save_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Ok(self.put_state(key, value).await?)
    }

    async fn delete_state(&self, key: &str) -> Result<(), StoreError> {
        Ok(self.remove_state(key).await?)
    }

    async fn release_resources(&self) {
        if let Err(e) = sqlx::query("PRAGMA shrink_memory").execute(&self.pool).await {
            warn!(error = %e, "Failed to shrink SQLite memory");
        }
    }
}
