use thiserror::Error;

use crate::driver::{Driver, QueryResult};
use crate::templater::Templater;
use crate::value::DbValue;

use super::{EditKind, EditTable, RowEdit};

/// Everything a commit needs, copied out of the session so the commit can
/// run without holding any session lock.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitPlan {
    /// Target metadata plus the original values of updated/deleted rows.
    pub table: EditTable,
    pub edits: Vec<RowEdit>,
}

/// One applied edit and the row as the server now stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedEdit {
    pub index: usize,
    pub row_id: i64,
    pub kind: EditKind,
    /// Read back via RETURNING or a re-select. `None` for deletes, or when
    /// the row could not be read back.
    pub row: Option<Vec<DbValue>>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("edit {edit_index} (row {row_id}) failed: {message}")]
pub struct CommitFailure {
    pub edit_index: usize,
    pub row_id: i64,
    /// SQL of the failing statement; empty if it could not be rendered.
    pub statement: String,
    pub message: String,
    /// Edits that were executed before the failure, in order.
    pub applied: Vec<CommittedEdit>,
}

/// Execute the plan's edits in staging order, stopping at the first
/// failure. Statements run on `driver` as-is; any enclosing transaction is
/// the caller's.
pub fn commit(
    plan: &CommitPlan,
    driver: &dyn Driver,
    mut on_applied: impl FnMut(&CommittedEdit),
) -> Result<Vec<CommittedEdit>, CommitFailure> {
    let templater = driver.dialect().templater();
    let mut applied: Vec<CommittedEdit> = Vec::with_capacity(plan.edits.len());

    for (index, edit) in plan.edits.iter().enumerate() {
        let statement = match edit.render(&plan.table, templater) {
            Ok(statement) => statement,
            Err(e) => {
                return Err(CommitFailure {
                    edit_index: index,
                    row_id: edit.row_id(),
                    statement: String::new(),
                    message: e.to_string(),
                    applied,
                })
            }
        };

        log::debug!("commit [{}/{}] {}", index + 1, plan.edits.len(), statement.sql);

        let outcome = match driver.execute(&statement.sql, &statement.params) {
            Ok(outcome) => outcome,
            Err(e) => {
                return Err(CommitFailure {
                    edit_index: index,
                    row_id: edit.row_id(),
                    statement: statement.sql,
                    message: e.to_string(),
                    applied,
                })
            }
        };

        // The row changed or vanished since it was fetched.
        if edit.kind() != EditKind::Create && outcome.rows_affected == 0 {
            return Err(CommitFailure {
                edit_index: index,
                row_id: edit.row_id(),
                statement: statement.sql,
                message: "no row matched the original key values".to_string(),
                applied,
            });
        }

        let committed = CommittedEdit {
            index,
            row_id: edit.row_id(),
            kind: edit.kind(),
            row: read_back(edit, &plan.table, templater, driver, &outcome),
        };
        on_applied(&committed);
        applied.push(committed);
    }

    Ok(applied)
}

fn read_back(
    edit: &RowEdit,
    table: &EditTable,
    templater: &dyn Templater,
    driver: &dyn Driver,
    outcome: &QueryResult,
) -> Option<Vec<DbValue>> {
    if edit.kind() == EditKind::Delete {
        return None;
    }
    if templater.supports_returning() {
        return outcome.rows.first().map(|row| table.project(&outcome.columns, row));
    }

    let statement = match edit.readback(table, templater, outcome) {
        Ok(Some(statement)) => statement,
        Ok(None) => return None,
        Err(e) => {
            log::warn!("cannot read back row {}: {}", edit.row_id(), e);
            return None;
        }
    };
    match driver.execute(&statement.sql, &statement.params) {
        Ok(result) => result.rows.first().map(|row| table.project(&result.columns, row)),
        Err(e) => {
            log::warn!("read back of row {} failed: {}", edit.row_id(), e);
            None
        }
    }
}
