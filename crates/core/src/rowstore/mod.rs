//! Tabular row storage behind the engine.
//!
//! Tables are named, rows are keyed by the `Request Number` column, cells are
//! text (empty string = empty cell). Implementations are raw: the locking
//! discipline lives with the callers, which always mutate under a row or
//! row-key lock from the lock manager.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::request::{columns, RowValues};
use crate::errors::ApplicationError;

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Column vocabulary of a table, in sheet order.
    async fn headers(&self, table: &str) -> Result<Vec<String>, ApplicationError>;

    async fn row_count(&self, table: &str) -> Result<u32, ApplicationError>;

    async fn read_row(&self, table: &str, row_id: u32)
        -> Result<Option<RowValues>, ApplicationError>;

    /// Exact match on the primary-key column. `None` when absent.
    async fn find_row(&self, table: &str, key_value: &str)
        -> Result<Option<u32>, ApplicationError>;

    /// Insert-or-update by primary key. `overwrite` replaces every cell;
    /// otherwise existing cell values win where the new cell is empty.
    async fn upsert_row(
        &self,
        table: &str,
        values: &RowValues,
        overwrite: bool,
    ) -> Result<u32, ApplicationError>;

    async fn set_cell(
        &self,
        table: &str,
        row_id: u32,
        column: &str,
        value: &str,
    ) -> Result<(), ApplicationError>;

    /// Batched variant; implementations may coalesce contiguous columns into
    /// a single range write.
    async fn set_cells(
        &self,
        table: &str,
        row_id: u32,
        cells: &[(String, String)],
    ) -> Result<(), ApplicationError>;

    /// Clears every cell from `start_column` (inclusive) to `end_column`
    /// (exclusive); `None` runs to end of row.
    async fn clear_range(
        &self,
        table: &str,
        row_id: u32,
        start_column: &str,
        end_column: Option<&str>,
    ) -> Result<(), ApplicationError>;

    async fn delete_row(&self, table: &str, row_id: u32) -> Result<(), ApplicationError>;
}

fn is_empty_cell(value: &str) -> bool {
    value.trim().is_empty()
}

struct MemoryTable {
    headers: Vec<String>,
    rows: Vec<RowValues>,
}

/// Hermetic row store used by unit and scenario tests.
#[derive(Default)]
pub struct InMemoryRowStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables<I, S>(table_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let mut tables = store.lock();
            for name in table_names {
                tables
                    .entry(name.into())
                    .or_insert_with(|| MemoryTable { headers: Vec::new(), rows: Vec::new() });
            }
        }
        store
    }

    /// Creates (or re-headers an empty) table with an explicit column order.
    /// Column order matters: range clears run along it.
    pub fn create_table<I, S>(&self, table: &str, headers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tables = self.lock();
        let entry = Self::table_mut(&mut tables, table);
        if entry.rows.is_empty() {
            entry.headers = headers.into_iter().map(Into::into).collect();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryTable>> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn table_mut<'a>(
        tables: &'a mut HashMap<String, MemoryTable>,
        table: &str,
    ) -> &'a mut MemoryTable {
        tables
            .entry(table.to_string())
            .or_insert_with(|| MemoryTable { headers: Vec::new(), rows: Vec::new() })
    }

    fn absorb_headers(table: &mut MemoryTable, values: &RowValues) {
        for column in values.keys() {
            if !table.headers.iter().any(|header| header == column) {
                table.headers.push(column.clone());
            }
        }
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn headers(&self, table: &str) -> Result<Vec<String>, ApplicationError> {
        Ok(self.lock().get(table).map(|t| t.headers.clone()).unwrap_or_default())
    }

    async fn row_count(&self, table: &str) -> Result<u32, ApplicationError> {
        Ok(self.lock().get(table).map(|t| t.rows.len() as u32).unwrap_or(0))
    }

    async fn read_row(
        &self,
        table: &str,
        row_id: u32,
    ) -> Result<Option<RowValues>, ApplicationError> {
        Ok(self.lock().get(table).and_then(|t| t.rows.get(row_id as usize).cloned()))
    }

    async fn find_row(
        &self,
        table: &str,
        key_value: &str,
    ) -> Result<Option<u32>, ApplicationError> {
        Ok(self.lock().get(table).and_then(|t| {
            t.rows.iter().position(|row| {
                row.get(columns::REQUEST_NUMBER).map(String::as_str) == Some(key_value)
            })
        })
        .map(|index| index as u32))
    }

    async fn upsert_row(
        &self,
        table: &str,
        values: &RowValues,
        overwrite: bool,
    ) -> Result<u32, ApplicationError> {
        let mut tables = self.lock();
        let table = Self::table_mut(&mut tables, table);
        Self::absorb_headers(table, values);

        let key = values.get(columns::REQUEST_NUMBER).map(String::as_str).unwrap_or("");
        let existing = (!key.is_empty())
            .then(|| {
                table.rows.iter().position(|row| {
                    row.get(columns::REQUEST_NUMBER).map(String::as_str) == Some(key)
                })
            })
            .flatten();

        match existing {
            Some(index) => {
                if overwrite {
                    table.rows[index] = values.clone();
                } else {
                    let row = &mut table.rows[index];
                    for (column, value) in values {
                        if is_empty_cell(value) {
                            continue;
                        }
                        let keep_existing = row
                            .get(column)
                            .map(|current| !is_empty_cell(current))
                            .unwrap_or(false);
                        if !keep_existing {
                            row.insert(column.clone(), value.clone());
                        }
                    }
                }
                Ok(index as u32)
            }
            None => {
                table.rows.push(values.clone());
                Ok((table.rows.len() - 1) as u32)
            }
        }
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
        let mut tables = self.lock();
        let table = Self::table_mut(&mut tables, table);
        let row = table
            .rows
            .get_mut(row_id as usize)
            .ok_or_else(|| ApplicationError::Persistence(format!("no row {row_id}")))?;
        for (column, value) in cells {
            row.insert(column.clone(), value.clone());
        }
        let snapshot: RowValues = row.clone();
        Self::absorb_headers(table, &snapshot);
        Ok(())
    }

    async fn clear_range(
        &self,
        table: &str,
        row_id: u32,
        start_column: &str,
        end_column: Option<&str>,
    ) -> Result<(), ApplicationError> {
        let mut tables = self.lock();
        let table = Self::table_mut(&mut tables, table);
        let start = table.headers.iter().position(|header| header == start_column);
        let Some(start) = start else {
            return Ok(());
        };
        let end = end_column
            .and_then(|column| table.headers.iter().position(|header| header == column))
            .unwrap_or(table.headers.len());
        let cleared: Vec<String> = table.headers[start..end].to_vec();

        let row = table
            .rows
            .get_mut(row_id as usize)
            .ok_or_else(|| ApplicationError::Persistence(format!("no row {row_id}")))?;
        for column in cleared {
            row.insert(column, String::new());
        }
        Ok(())
    }

    async fn delete_row(&self, table: &str, row_id: u32) -> Result<(), ApplicationError> {
        let mut tables = self.lock();
        let table = Self::table_mut(&mut tables, table);
        if (row_id as usize) < table.rows.len() {
            table.rows.remove(row_id as usize);
        }
        Ok(())
    }
}
