//! SQL-backed row store: sheet-shaped tables over a cell-granular schema.
//!
//! Headers are cached until a write grows them; row reads go through a
//! short-lived cache that every mutation of the row invalidates. The store
//! itself takes no locks; callers mutate under the engine's row locks.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::Row;

use caseflow_core::columns;
use caseflow_core::rowstore::RowStore;
use caseflow_core::{ApplicationError, RowValues};

use super::RepositoryError;
use crate::DbPool;

const ROW_CACHE_TTL: Duration = Duration::from_secs(60);

pub struct SqlRowStore {
    pool: DbPool,
    headers: Mutex<HashMap<String, Vec<String>>>,
    row_cache: Mutex<HashMap<(String, u32), (Instant, RowValues)>>,
}

impl SqlRowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, headers: Mutex::new(HashMap::new()), row_cache: Mutex::new(HashMap::new()) }
    }

    /// Seeds a table's header row if it has none yet. Column order matters:
    /// range clears and the batch write heuristic follow it.
    pub async fn create_table<I, S>(&self, table: &str, header_names: I) -> Result<(), ApplicationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let existing = self.load_headers(table).await?;
        if !existing.is_empty() {
            return Ok(());
        }
        for (index, name) in header_names.into_iter().enumerate() {
            sqlx::query(
                "INSERT INTO sheet_header (table_name, col_idx, col_name)
                 VALUES (?, ?, ?)
                 ON CONFLICT (table_name, col_name) DO NOTHING",
            )
            .bind(table)
            .bind(index as i64)
            .bind(name.into())
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        }
        self.invalidate_headers(table);
        Ok(())
    }

    fn invalidate_headers(&self, table: &str) {
        if let Ok(mut headers) = self.headers.lock() {
            headers.remove(table);
        }
    }

    fn invalidate_row(&self, table: &str, row_id: u32) {
        if let Ok(mut cache) = self.row_cache.lock() {
            cache.remove(&(table.to_string(), row_id));
        }
    }

    async fn load_headers(&self, table: &str) -> Result<Vec<String>, ApplicationError> {
        if let Ok(cache) = self.headers.lock() {
            if let Some(headers) = cache.get(table) {
                return Ok(headers.clone());
            }
        }
        let rows = sqlx::query(
            "SELECT col_name FROM sheet_header WHERE table_name = ? ORDER BY col_idx ASC",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        let headers: Vec<String> = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("col_name"))
            .collect::<Result<_, _>>()
            .map_err(RepositoryError::from)?;
        if let Ok(mut cache) = self.headers.lock() {
            cache.insert(table.to_string(), headers.clone());
        }
        Ok(headers)
    }

    /// Appends any unknown columns to the table's header row.
    async fn ensure_columns<'a>(
        &self,
        table: &str,
        names: impl Iterator<Item = &'a str>,
    ) -> Result<(), ApplicationError> {
        let known = self.load_headers(table).await?;
        let mut next_idx = known.len() as i64;
        let mut grew = false;
        for name in names {
            if known.iter().any(|header| header == name) {
                continue;
            }
            sqlx::query(
                "INSERT INTO sheet_header (table_name, col_idx, col_name)
                 VALUES (?, ?, ?)
                 ON CONFLICT (table_name, col_name) DO NOTHING",
            )
            .bind(table)
            .bind(next_idx)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
            next_idx += 1;
            grew = true;
        }
        if grew {
            self.invalidate_headers(table);
        }
        Ok(())
    }

    async fn row_exists(&self, table: &str, row_id: u32) -> Result<bool, ApplicationError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sheet_row WHERE table_name = ? AND row_idx = ?",
        )
        .bind(table)
        .bind(i64::from(row_id))
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(count > 0)
    }

    async fn write_cells(
        &self,
        table: &str,
        row_id: u32,
        cells: &[(String, String)],
        keep_existing_nonempty: bool,
    ) -> Result<(), ApplicationError> {
        for (column, value) in cells {
            if keep_existing_nonempty {
                sqlx::query(
                    "INSERT INTO sheet_cell (table_name, row_idx, col_name, value)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT (table_name, row_idx, col_name)
                     DO UPDATE SET value = excluded.value
                     WHERE sheet_cell.value = ''",
                )
                .bind(table)
                .bind(i64::from(row_id))
                .bind(column)
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(RepositoryError::from)?;
            } else {
                sqlx::query(
                    "INSERT INTO sheet_cell (table_name, row_idx, col_name, value)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT (table_name, row_idx, col_name)
                     DO UPDATE SET value = excluded.value",
                )
                .bind(table)
                .bind(i64::from(row_id))
                .bind(column)
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(RepositoryError::from)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for SqlRowStore {
    async fn headers(&self, table: &str) -> Result<Vec<String>, ApplicationError> {
        self.load_headers(table).await
    }

    async fn row_count(&self, table: &str) -> Result<u32, ApplicationError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sheet_row WHERE table_name = ?")
                .bind(table)
                .fetch_one(&self.pool)
                .await
                .map_err(RepositoryError::from)?;
        Ok(count as u32)
    }

    async fn read_row(
        &self,
        table: &str,
        row_id: u32,
    ) -> Result<Option<RowValues>, ApplicationError> {
        if let Ok(cache) = self.row_cache.lock() {
            if let Some((loaded_at, values)) = cache.get(&(table.to_string(), row_id)) {
                if loaded_at.elapsed() < ROW_CACHE_TTL {
                    return Ok(Some(values.clone()));
                }
            }
        }

        if !self.row_exists(table, row_id).await? {
            return Ok(None);
        }

        let rows = sqlx::query(
            "SELECT col_name, value FROM sheet_cell WHERE table_name = ? AND row_idx = ?",
        )
        .bind(table)
        .bind(i64::from(row_id))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let mut values = RowValues::new();
        for row in rows {
            let column: String = row.try_get("col_name").map_err(RepositoryError::from)?;
            let value: String = row.try_get("value").map_err(RepositoryError::from)?;
            values.insert(column, value);
        }

        if let Ok(mut cache) = self.row_cache.lock() {
            cache.insert((table.to_string(), row_id), (Instant::now(), values.clone()));
        }
        Ok(Some(values))
    }

    async fn find_row(
        &self,
        table: &str,
        key_value: &str,
    ) -> Result<Option<u32>, ApplicationError> {
        let row_idx: Option<i64> = sqlx::query_scalar(
            "SELECT row_idx FROM sheet_cell
             WHERE table_name = ? AND col_name = ? AND value = ?
             ORDER BY row_idx ASC
             LIMIT 1",
        )
        .bind(table)
        .bind(columns::REQUEST_NUMBER)
        .bind(key_value)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(row_idx.map(|idx| idx as u32))
    }

    async fn upsert_row(
        &self,
        table: &str,
        values: &RowValues,
        overwrite: bool,
    ) -> Result<u32, ApplicationError> {
        self.ensure_columns(table, values.keys().map(String::as_str)).await?;

        let key = values.get(columns::REQUEST_NUMBER).map(String::as_str).unwrap_or("");
        let existing =
            if key.is_empty() { None } else { self.find_row(table, key).await? };

        let row_id = match existing {
            Some(row_id) => {
                if overwrite {
                    sqlx::query("DELETE FROM sheet_cell WHERE table_name = ? AND row_idx = ?")
                        .bind(table)
                        .bind(i64::from(row_id))
                        .execute(&self.pool)
                        .await
                        .map_err(RepositoryError::from)?;
                }
                row_id
            }
            None => {
                let next: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(row_idx) + 1, 0) FROM sheet_row WHERE table_name = ?",
                )
                .bind(table)
                .fetch_one(&self.pool)
                .await
                .map_err(RepositoryError::from)?;
                sqlx::query("INSERT INTO sheet_row (table_name, row_idx) VALUES (?, ?)")
                    .bind(table)
                    .bind(next)
                    .execute(&self.pool)
                    .await
                    .map_err(RepositoryError::from)?;
                next as u32
            }
        };

        let non_empty: Vec<(String, String)> = values
            .iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
        let keep_existing = existing.is_some() && !overwrite;
        self.write_cells(table, row_id, &non_empty, keep_existing).await?;

        self.invalidate_row(table, row_id);
        Ok(row_id)
    }

    async fn set_cell(
        &self,
        table: &str,
        row_id: u32,
        column: &str,
        value: &str,
    ) -> Result<(), ApplicationError> {
        self.set_cells(table, row_id, &[(column.to_string(), value.to_string())]).await
    }

    async fn set_cells(
        &self,
        table: &str,
        row_id: u32,
        cells: &[(String, String)],
    ) -> Result<(), ApplicationError> {
        if !self.row_exists(table, row_id).await? {
            return Err(ApplicationError::Persistence(format!(
                "no row {row_id} in {table}"
            )));
        }
        self.ensure_columns(table, cells.iter().map(|(column, _)| column.as_str())).await?;

        // Contiguous-column batches go down in one multi-row statement;
        // scattered columns fall back to per-cell writes.
        let headers = self.load_headers(table).await?;
        let mut indexed: Vec<(usize, &(String, String))> = cells
            .iter()
            .filter_map(|cell| {
                headers.iter().position(|header| *header == cell.0).map(|idx| (idx, cell))
            })
            .collect();
        indexed.sort_by_key(|(idx, _)| *idx);
        let contiguous = indexed
            .windows(2)
            .all(|pair| pair[1].0 == pair[0].0 + 1);

        if contiguous && indexed.len() > 1 {
            let mut query = String::from(
                "INSERT INTO sheet_cell (table_name, row_idx, col_name, value) VALUES ",
            );
            query.push_str(
                &indexed.iter().map(|_| "(?, ?, ?, ?)").collect::<Vec<_>>().join(", "),
            );
            query.push_str(
                " ON CONFLICT (table_name, row_idx, col_name) DO UPDATE SET value = excluded.value",
            );
            let mut statement = sqlx::query(&query);
            for (_, (column, value)) in &indexed {
                statement = statement
                    .bind(table)
                    .bind(i64::from(row_id))
                    .bind(column)
                    .bind(value);
            }
            statement.execute(&self.pool).await.map_err(RepositoryError::from)?;
        } else {
            self.write_cells(table, row_id, cells, false).await?;
        }

        self.invalidate_row(table, row_id);
        Ok(())
    }

    async fn clear_range(
        &self,
        table: &str,
        row_id: u32,
        start_column: &str,
        end_column: Option<&str>,
    ) -> Result<(), ApplicationError> {
        let headers = self.load_headers(table).await?;
        let Some(start) = headers.iter().position(|header| header == start_column) else {
            return Ok(());
        };
        let end = end_column
            .and_then(|column| headers.iter().position(|header| header == column))
            .unwrap_or(headers.len());

        for column in &headers[start..end] {
            sqlx::query(
                "DELETE FROM sheet_cell WHERE table_name = ? AND row_idx = ? AND col_name = ?",
            )
            .bind(table)
            .bind(i64::from(row_id))
            .bind(column)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        }

        self.invalidate_row(table, row_id);
        Ok(())
    }

    async fn delete_row(&self, table: &str, row_id: u32) -> Result<(), ApplicationError> {
        sqlx::query("DELETE FROM sheet_row WHERE table_name = ? AND row_idx = ?")
            .bind(table)
            .bind(i64::from(row_id))
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        self.invalidate_row(table, row_id);
        Ok(())
    }
}
