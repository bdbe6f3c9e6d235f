//! Price snapshot operations for the repository.

use crate::domain::{PriceSnapshot, RecordId, Stored, Symbol, TimeMs, DAY_MS};
use crate::store::{PriceFilter, PriceQuery, PriceUpdate, SortOrder};
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};

use super::{ids_json, Repository};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Shared predicate for every price statement; binds ?1..?5.
const PRICE_WHERE: &str = r#"
    (?1 IS NULL OR symbol = ?1)
    AND (?2 IS NULL OR timestamp_ms >= ?2)
    AND (?3 IS NULL OR timestamp_ms < ?3)
    AND (?4 IS NULL OR id IN (SELECT value FROM json_each(?4)))
    AND (?5 IS NULL OR compressed = ?5)
"#;

fn bind_filter<'q>(query: SqliteQuery<'q>, filter: &PriceFilter) -> SqliteQuery<'q> {
    query
        .bind(filter.symbol.as_ref().map(|s| s.as_str().to_string()))
        .bind(filter.from.map(|t| t.as_ms()))
        .bind(filter.until.map(|t| t.as_ms()))
        .bind(ids_json(filter.ids.as_deref()))
        .bind(filter.compressed)
}

fn row_to_price(row: &SqliteRow) -> Stored<PriceSnapshot> {
    Stored::new(
        row.get::<i64, _>("id"),
        PriceSnapshot {
            symbol: Symbol::new(row.get::<String, _>("symbol")),
            timestamp: TimeMs::new(row.get::<i64, _>("timestamp_ms")),
            price: row.get::<f64, _>("price"),
            previous_close: row.get::<f64, _>("previous_close"),
            volume: row.get::<Option<f64>, _>("volume"),
        },
    )
}

impl Repository {
    /// Insert price snapshots in a single transaction.
    ///
    /// # Errors
    /// Returns an error if any insert fails; nothing from the call is kept.
    pub async fn insert_prices(
        &self,
        snapshots: &[PriceSnapshot],
    ) -> Result<Vec<RecordId>, sqlx::Error> {
        if snapshots.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(snapshots.len());
        let mut tx = self.pool.begin().await?;

        for snapshot in snapshots {
            let result = sqlx::query(
                r#"
                INSERT INTO price_snapshots (symbol, timestamp_ms, price, previous_close, volume)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(snapshot.symbol.as_str())
            .bind(snapshot.timestamp.as_ms())
            .bind(snapshot.price)
            .bind(snapshot.previous_close)
            .bind(snapshot.volume)
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Query price snapshots matching a filter, ordered by timestamp.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_prices(
        &self,
        query: &PriceQuery,
    ) -> Result<Vec<Stored<PriceSnapshot>>, sqlx::Error> {
        let direction = match query.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let sql = format!(
            r#"
            SELECT id, symbol, timestamp_ms, price, previous_close, volume
            FROM price_snapshots
            WHERE {PRICE_WHERE}
            ORDER BY timestamp_ms {direction}, id {direction}
            LIMIT ?6 OFFSET ?7
            "#
        );

        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = bind_filter(sqlx::query(&sql), &query.filter)
            .bind(limit)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_price).collect())
    }

    /// Count price snapshots matching a filter.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_prices_matching(&self, filter: &PriceFilter) -> Result<usize, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) AS n FROM price_snapshots WHERE {PRICE_WHERE}");
        let row = bind_filter(sqlx::query(&sql), filter)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n").max(0) as usize)
    }

    /// Delete price snapshots matching a filter.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_prices_matching(&self, filter: &PriceFilter) -> Result<usize, sqlx::Error> {
        let sql = format!("DELETE FROM price_snapshots WHERE {PRICE_WHERE}");
        let result = bind_filter(sqlx::query(&sql), filter)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    /// Apply a field update to price snapshots matching a filter.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn update_prices_matching(
        &self,
        filter: &PriceFilter,
        update: &PriceUpdate,
    ) -> Result<usize, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE price_snapshots SET
                price = CASE WHEN ?6 IS NULL THEN price ELSE price * ?6 END,
                previous_close = CASE WHEN ?6 IS NULL THEN previous_close ELSE previous_close * ?6 END,
                volume = COALESCE(?7, volume),
                compressed = CASE WHEN ?8 THEN 1 ELSE compressed END
            WHERE {PRICE_WHERE}
            "#
        );
        let result = bind_filter(sqlx::query(&sql), filter)
            .bind(update.price_scale)
            .bind(update.volume)
            .bind(update.mark_compressed)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    /// Distinct symbols with stored prices.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_price_symbols(&self) -> Result<Vec<Symbol>, sqlx::Error> {
        let rows = sqlx::query("SELECT DISTINCT symbol FROM price_snapshots ORDER BY symbol ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| Symbol::new(row.get::<String, _>("symbol")))
            .collect())
    }

    /// Distinct UTC days that have at least one matching price.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_price_days(&self, filter: &PriceFilter) -> Result<Vec<NaiveDate>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT DISTINCT (timestamp_ms / {DAY_MS}) AS day_index
            FROM price_snapshots
            WHERE {PRICE_WHERE}
            ORDER BY day_index ASC
            "#
        );
        let rows = bind_filter(sqlx::query(&sql), filter)
            .fetch_all(&self.pool)
            .await?;
        let mut days: Vec<NaiveDate> = rows
            .iter()
            .map(|row| TimeMs::new(row.get::<i64, _>("day_index") * DAY_MS).day())
            .collect();
        days.dedup();
        Ok(days)
    }
}
