//! `query/*` params, results and notifications.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteStringParams {
    pub owner_uri: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbColumnInfo {
    pub column_name: String,
    pub data_type: String,
    pub column_ordinal: usize,
    #[serde(default)]
    pub is_key: bool,
    #[serde(default)]
    pub is_identity: bool,
    #[serde(default = "default_true")]
    pub allow_null: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCellValue {
    pub display_value: String,
    pub is_null: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSetSummary {
    pub id: usize,
    pub batch_id: usize,
    pub row_count: u64,
    pub column_info: Vec<DbColumnInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub id: usize,
    pub has_error: bool,
    /// RFC 3339
    pub execution_start: String,
    pub execution_end: String,
    /// Milliseconds.
    pub execution_elapsed: i64,
    pub result_set_summaries: Vec<ResultSetSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCompleteParams {
    pub owner_uri: String,
    pub batch_summaries: Vec<BatchSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub batch_id: usize,
    pub is_error: bool,
    pub time: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMessageParams {
    pub owner_uri: String,
    pub message: ResultMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsetParams {
    pub owner_uri: String,
    #[serde(default)]
    pub batch_index: usize,
    #[serde(default)]
    pub result_set_index: usize,
    pub rows_start_index: u64,
    pub rows_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSubset {
    pub row_count: u64,
    pub rows: Vec<Vec<DbCellValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsetResult {
    pub result_subset: ResultSubset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerParams {
    pub owner_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<String>,
}
