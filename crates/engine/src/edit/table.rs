use crate::driver::{ColumnMeta, ObjectRef};
use crate::value::DbValue;

use super::EditError;

/// A fetched row. Ids are stable for the life of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct RowData {
    pub id: i64,
    pub values: Vec<DbValue>,
}

/// The edit target: object, column metadata and the materialized rows.
///
/// Rows are kept sorted by id. Fetched rows get ids `0..n`; rows created
/// later always get larger ids, so appending preserves the order.
#[derive(Debug, Clone, PartialEq)]
pub struct EditTable {
    pub object: ObjectRef,
    pub columns: Vec<ColumnMeta>,
    rows: Vec<RowData>,
}

impl EditTable {
    pub fn new(object: ObjectRef, columns: Vec<ColumnMeta>, rows: Vec<Vec<DbValue>>) -> Self {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, values)| RowData {
                id: i as i64,
                values,
            })
            .collect();
        Self {
            object,
            columns,
            rows,
        }
    }

    pub fn rows(&self) -> &[RowData] {
        &self.rows
    }

    pub fn row(&self, id: i64) -> Option<&RowData> {
        self.rows
            .binary_search_by_key(&id, |r| r.id)
            .ok()
            .map(|idx| &self.rows[idx])
    }

    pub fn column(&self, idx: usize) -> Result<&ColumnMeta, EditError> {
        self.columns.get(idx).ok_or(EditError::ColumnNotFound(idx))
    }

    pub fn identity_column(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.is_identity)
    }

    /// Columns that identify a row in WHERE clauses. Without a declared key
    /// every column takes part.
    pub fn key_columns(&self) -> Vec<usize> {
        let keys: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_key)
            .map(|(i, _)| i)
            .collect();
        if keys.is_empty() {
            (0..self.columns.len()).collect()
        } else {
            keys
        }
    }

    /// Reorder a driver row into this table's column order, matching by
    /// name. Columns the driver did not return come back NULL.
    pub fn project(&self, columns: &[ColumnMeta], row: &[DbValue]) -> Vec<DbValue> {
        self.columns
            .iter()
            .map(|target| {
                columns
                    .iter()
                    .position(|c| c.name == target.name)
                    .and_then(|i| row.get(i).cloned())
                    .unwrap_or(DbValue::Null)
            })
            .collect()
    }

    /// Copy of the table holding only the given rows.
    pub fn with_rows(&self, ids: &[i64]) -> EditTable {
        EditTable {
            object: self.object.clone(),
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|r| ids.contains(&r.id))
                .cloned()
                .collect(),
        }
    }

    pub(crate) fn upsert_row(&mut self, id: i64, values: Vec<DbValue>) {
        match self.rows.binary_search_by_key(&id, |r| r.id) {
            Ok(idx) => self.rows[idx].values = values,
            Err(idx) => self.rows.insert(idx, RowData { id, values }),
        }
    }

    pub(crate) fn remove_row(&mut self, id: i64) {
        if let Ok(idx) = self.rows.binary_search_by_key(&id, |r| r.id) {
            self.rows.remove(idx);
        }
    }
}
