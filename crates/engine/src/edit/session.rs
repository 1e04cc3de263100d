use serde_json::Value;

use crate::value::DbValue;

use super::{CellUpdate, CommitPlan, CommittedEdit, EditError, EditKind, EditScript, EditTable, RowEdit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Clean,
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellView {
    pub value: DbValue,
    pub is_dirty: bool,
}

/// A row as the client should display it: fetched values overlaid with the
/// row's pending edit.
#[derive(Debug, Clone, PartialEq)]
pub struct RowView {
    pub id: i64,
    pub state: RowState,
    pub cells: Vec<CellView>,
}

impl RowView {
    pub fn is_dirty(&self) -> bool {
        self.state != RowState::Clean
    }
}

/// Fetched rows plus the pending edit script for one edit target.
#[derive(Debug, Clone)]
pub struct EditSession {
    table: EditTable,
    script: EditScript,
    next_row_id: i64,
}

impl EditSession {
    pub fn new(table: EditTable) -> Self {
        let next_row_id = table.rows().last().map(|r| r.id + 1).unwrap_or(0);
        Self {
            table,
            script: EditScript::new(),
            next_row_id,
        }
    }

    pub fn table(&self) -> &EditTable {
        &self.table
    }

    pub fn script(&self) -> &EditScript {
        &self.script
    }

    fn pending_creates(&self) -> impl Iterator<Item = i64> + '_ {
        self.script
            .iter()
            .filter(|e| e.kind() == EditKind::Create)
            .map(|e| e.row_id())
    }

    /// Fetched rows plus rows created but not yet committed.
    pub fn row_count(&self) -> usize {
        self.table.rows().len() + self.pending_creates().count()
    }

    /// Rows `start..start + count` of the display order: fetched rows by id,
    /// then pending creates in staging order.
    pub fn rows(&self, start: usize, count: usize) -> Vec<RowView> {
        self.table
            .rows()
            .iter()
            .map(|r| r.id)
            .chain(self.pending_creates())
            .skip(start)
            .take(count)
            .filter_map(|id| self.row_view(id).ok())
            .collect()
    }

    pub fn row_view(&self, row_id: i64) -> Result<RowView, EditError> {
        let pending = self.script.get(row_id);
        let base: Vec<DbValue> = match (self.table.row(row_id), pending) {
            (Some(row), _) => row.values.clone(),
            (None, Some(RowEdit::Create { .. })) => vec![DbValue::Null; self.table.columns.len()],
            (None, _) => return Err(EditError::RowNotFound(row_id)),
        };

        let mut cells: Vec<CellView> = base
            .into_iter()
            .map(|value| CellView {
                value,
                is_dirty: false,
            })
            .collect();

        let state = match pending {
            None => RowState::Clean,
            Some(RowEdit::Delete { .. }) => RowState::Deleted,
            Some(RowEdit::Update { cells: updates, .. }) => {
                for (column, update) in updates {
                    if let Some(cell) = cells.get_mut(*column) {
                        cell.value = update.new_value.clone();
                        cell.is_dirty = true;
                    }
                }
                RowState::Updated
            }
            Some(RowEdit::Create { values, .. }) => {
                for (column, value) in values {
                    if let Some(cell) = cells.get_mut(*column) {
                        cell.value = value.clone();
                        cell.is_dirty = true;
                    }
                }
                RowState::Inserted
            }
        };

        Ok(RowView {
            id: row_id,
            state,
            cells,
        })
    }

    fn cell_view(&self, row_id: i64, column: usize) -> Result<(CellView, bool), EditError> {
        let view = self.row_view(row_id)?;
        let dirty = view.is_dirty();
        let cell = view
            .cells
            .into_iter()
            .nth(column)
            .ok_or(EditError::ColumnNotFound(column))?;
        Ok((cell, dirty))
    }

    /// Stage a new empty row. Returns its id and each column's server default.
    pub fn create_row(&mut self) -> Result<(i64, Vec<Option<String>>), EditError> {
        let row_id = self.next_row_id;
        self.script.stage(RowEdit::create(row_id))?;
        self.next_row_id += 1;
        let defaults = self
            .table
            .columns
            .iter()
            .map(|c| if c.is_identity { None } else { c.default_value.clone() })
            .collect();
        Ok((row_id, defaults))
    }

    /// Stage a new value for one cell. Returns the cell's display state and
    /// whether the row is dirty.
    pub fn update_cell(&mut self, row_id: i64, column: usize, input: &Value) -> Result<(CellView, bool), EditError> {
        let meta = self.table.column(column)?;
        if !meta.is_updatable() {
            return Err(EditError::ColumnReadOnly(meta.name.clone()));
        }
        let new_value = DbValue::coerce(input, &meta.data_type).map_err(|e| EditError::InvalidValue {
            column: meta.name.clone(),
            reason: e.to_string(),
        })?;

        let old_display = match (self.table.row(row_id), self.script.get(row_id)) {
            (Some(row), _) => row.values.get(column).map(DbValue::display).unwrap_or_default(),
            (None, Some(RowEdit::Create { .. })) => String::new(),
            (None, _) => return Err(EditError::RowNotFound(row_id)),
        };

        self.script.stage(RowEdit::update(
            row_id,
            CellUpdate {
                column,
                old_display,
                new_value,
            },
        ))?;
        self.cell_view(row_id, column)
    }

    pub fn delete_row(&mut self, row_id: i64) -> Result<(), EditError> {
        if self.table.row(row_id).is_none() && self.script.get(row_id).is_none() {
            return Err(EditError::RowNotFound(row_id));
        }
        self.script.stage(RowEdit::delete(row_id)).map(|_| ())
    }

    pub fn revert_row(&mut self, row_id: i64) {
        self.script.revert(row_id);
    }

    pub fn revert_cell(&mut self, row_id: i64, column: usize) -> Result<(CellView, bool), EditError> {
        self.table.column(column)?;
        self.script.revert_cell(row_id, column);
        self.cell_view(row_id, column)
    }

    /// Snapshot of everything a commit needs, detached from the session.
    pub fn commit_plan(&self) -> CommitPlan {
        let touched: Vec<i64> = self
            .script
            .iter()
            .filter(|e| e.kind() != EditKind::Create)
            .map(|e| e.row_id())
            .collect();
        CommitPlan {
            table: self.table.with_rows(&touched),
            edits: self.script.edits().to_vec(),
        }
    }

    /// Fold committed edits (a prefix of the script) into the fetched rows
    /// and drop them from the script.
    pub fn apply_committed(&mut self, committed: &[CommittedEdit]) {
        for edit in committed {
            match edit.kind {
                EditKind::Delete => self.table.remove_row(edit.row_id),
                EditKind::Create | EditKind::Update => {
                    let values = match &edit.row {
                        Some(row) => row.clone(),
                        None => match self.row_view(edit.row_id) {
                            Ok(view) => view.cells.into_iter().map(|c| c.value).collect(),
                            Err(_) => continue,
                        },
                    };
                    self.table.upsert_row(edit.row_id, values);
                }
            }
        }
        self.script.drain_applied(committed.len());
    }
}
