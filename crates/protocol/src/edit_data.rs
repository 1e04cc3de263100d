//! `edit/*` params and results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_results: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub owner_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub object_name: String,
    #[serde(default = "default_object_type")]
    pub object_type: String,
    /// Custom SELECT for the rows; defaults to the whole object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_string: Option<String>,
    #[serde(default)]
    pub filters: InitializeFilters,
}

fn default_object_type() -> String {
    "table".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReadyParams {
    pub owner_uri: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerParams {
    pub owner_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsetParams {
    pub owner_uri: String,
    pub row_start_index: u64,
    pub row_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditRowState {
    Clean,
    DirtyInsert,
    DirtyUpdate,
    DirtyDelete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditCell {
    pub display_value: String,
    pub is_null: bool,
    pub is_dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRow {
    pub id: i64,
    pub is_dirty: bool,
    pub state: EditRowState,
    pub cells: Vec<EditCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsetResult {
    pub row_count: u64,
    pub subset: Vec<EditRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRowResult {
    pub new_row_id: i64,
    /// Server default per column, `None` when the column has none.
    pub default_values: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowParams {
    pub owner_uri: String,
    pub row_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCellParams {
    pub owner_uri: String,
    pub row_id: i64,
    pub column_id: usize,
    /// JSON `null` stores SQL NULL; strings are coerced by column type.
    pub new_value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertCellParams {
    pub owner_uri: String,
    pub row_id: i64,
    pub column_id: usize,
}

/// Result of `updateCell` and `revertCell`: the cell's pending display state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellResult {
    pub cell: EditCell,
    pub is_row_dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitProgressParams {
    pub owner_uri: String,
    pub edit_index: usize,
    pub row_id: i64,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedRow {
    pub row_id: i64,
    pub kind: EditKind,
    /// Row as read back after the statement; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cells: Option<Vec<EditCell>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    pub rows: Vec<CommittedRow>,
}

/// `data` of a `COMMIT_FAILED` error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitFailureData {
    pub edit_index: usize,
    pub row_id: i64,
    pub statement: String,
    pub applied: usize,
}
