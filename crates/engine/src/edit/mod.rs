//! Edit-data transaction engine.
//!
//! A client fetches rows into an [`EditSession`], stages per-row edits into
//! an [`EditScript`], then [`commit`]s them against a live [`Driver`]. SQL
//! text always comes from the dialect's [`Templater`].
//!
//! [`Driver`]: crate::driver::Driver
//! [`Templater`]: crate::templater::Templater

mod commit;
mod row_edit;
mod script;
mod session;
mod table;

pub use commit::{commit, CommitFailure, CommitPlan, CommittedEdit};
pub use row_edit::{CellUpdate, EditKind, RowEdit, Statement};
pub use script::EditScript;
pub use session::{CellView, EditSession, RowState, RowView};
pub use table::{EditTable, RowData};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditError {
    #[error("row {0} is already marked for deletion")]
    RowDeleted(i64),

    #[error("row {0} already has a pending edit")]
    PendingEdit(i64),

    #[error("row {0} does not exist")]
    RowNotFound(i64),

    #[error("column {0} does not exist")]
    ColumnNotFound(usize),

    #[error("column '{0}' is read-only")]
    ColumnReadOnly(String),

    #[error("invalid value for column '{column}': {reason}")]
    InvalidValue { column: String, reason: String },
}
