//! Historical portfolio snapshot operations for the repository.

use crate::domain::{HistoricalPortfolioSnapshot, PositionSnapshot, RecordId, Stored, Symbol, TimeMs};
use crate::store::{PortfolioFilter, PortfolioQuery, PortfolioUpdate, SortOrder, StoreError};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};
use std::collections::BTreeMap;
use tracing::warn;

use super::{ids_json, Repository};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Shared predicate for every portfolio statement; binds ?1..?4.
const PORTFOLIO_WHERE: &str = r#"
    (?1 IS NULL OR date_ms >= ?1)
    AND (?2 IS NULL OR date_ms < ?2)
    AND (?3 IS NULL OR currency = ?3)
    AND (?4 IS NULL OR id IN (SELECT value FROM json_each(?4)))
"#;

fn bind_filter<'q>(query: SqliteQuery<'q>, filter: &PortfolioFilter) -> SqliteQuery<'q> {
    query
        .bind(filter.from.map(|t| t.as_ms()))
        .bind(filter.until.map(|t| t.as_ms()))
        .bind(filter.currency.clone())
        .bind(ids_json(filter.ids.as_deref()))
}

fn row_to_snapshot(row: &SqliteRow) -> Stored<HistoricalPortfolioSnapshot> {
    let id = row.get::<i64, _>("id");
    let composition_json = row.get::<String, _>("composition_json");
    let composition: BTreeMap<Symbol, PositionSnapshot> =
        serde_json::from_str(&composition_json).unwrap_or_else(|e| {
            warn!(id, error = %e, "Failed to parse stored composition, using empty map");
            BTreeMap::new()
        });

    Stored::new(
        id,
        HistoricalPortfolioSnapshot {
            date: TimeMs::new(row.get::<i64, _>("date_ms")),
            total_value: row.get::<f64, _>("total_value"),
            total_gains: row.get::<f64, _>("total_gains"),
            total_cost: row.get::<f64, _>("total_cost"),
            currency: row.get::<String, _>("currency"),
            composition,
            composition_fingerprint: row.get::<String, _>("fingerprint"),
        },
    )
}

impl Repository {
    /// Insert portfolio snapshots in a single transaction.
    ///
    /// # Errors
    /// Returns an error if serialization or any insert fails.
    pub async fn insert_portfolio_snapshots(
        &self,
        snapshots: &[HistoricalPortfolioSnapshot],
    ) -> Result<Vec<RecordId>, StoreError> {
        if snapshots.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(snapshots.len());
        let mut tx = self.pool.begin().await?;

        for snapshot in snapshots {
            let composition_json = serde_json::to_string(&snapshot.composition)?;
            let result = sqlx::query(
                r#"
                INSERT INTO portfolio_snapshots (
                    date_ms, total_value, total_gains, total_cost, currency,
                    composition_json, fingerprint
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(snapshot.date.as_ms())
            .bind(snapshot.total_value)
            .bind(snapshot.total_gains)
            .bind(snapshot.total_cost)
            .bind(snapshot.currency.as_str())
            .bind(composition_json)
            .bind(snapshot.composition_fingerprint.as_str())
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Query portfolio snapshots matching a filter, ordered by date.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_portfolio_snapshots(
        &self,
        query: &PortfolioQuery,
    ) -> Result<Vec<Stored<HistoricalPortfolioSnapshot>>, sqlx::Error> {
        let direction = match query.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let sql = format!(
            r#"
            SELECT id, date_ms, total_value, total_gains, total_cost, currency,
                   composition_json, fingerprint
            FROM portfolio_snapshots
            WHERE {PORTFOLIO_WHERE}
            ORDER BY date_ms {direction}, id {direction}
            LIMIT ?5 OFFSET ?6
            "#
        );

        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = bind_filter(sqlx::query(&sql), &query.filter)
            .bind(limit)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_snapshot).collect())
    }

    /// Count portfolio snapshots matching a filter.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_portfolio_matching(
        &self,
        filter: &PortfolioFilter,
    ) -> Result<usize, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) AS n FROM portfolio_snapshots WHERE {PORTFOLIO_WHERE}");
        let row = bind_filter(sqlx::query(&sql), filter)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n").max(0) as usize)
    }

    /// Delete portfolio snapshots matching a filter.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_portfolio_matching(
        &self,
        filter: &PortfolioFilter,
    ) -> Result<usize, sqlx::Error> {
        let sql = format!("DELETE FROM portfolio_snapshots WHERE {PORTFOLIO_WHERE}");
        let result = bind_filter(sqlx::query(&sql), filter)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    /// Rescale and/or relabel portfolio snapshots matching a filter.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn update_portfolio_matching(
        &self,
        filter: &PortfolioFilter,
        update: &PortfolioUpdate,
    ) -> Result<usize, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE portfolio_snapshots SET
                total_value = CASE WHEN ?5 IS NULL THEN total_value ELSE total_value * ?5 END,
                total_cost = CASE WHEN ?5 IS NULL THEN total_cost ELSE total_cost * ?5 END,
                total_gains = CASE WHEN ?5 IS NULL THEN total_gains
                                   ELSE (total_value - total_cost) * ?5 END,
                currency = COALESCE(?6, currency)
            WHERE {PORTFOLIO_WHERE}
            "#
        );
        let result = bind_filter(sqlx::query(&sql), filter)
            .bind(update.value_scale)
            .bind(update.currency.clone())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
