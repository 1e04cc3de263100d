//! `chat/*` params and notifications.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequestParams {
    pub conversation_uri: String,
    pub prompt: String,
    /// When set and connected, the catalog of this owner is added as context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdateParams {
    pub conversation_uri: String,
    pub content: String,
}

/// Terminal notification of a completion. Always `isComplete: true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResultParams {
    pub conversation_uri: String,
    pub content: String,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Forget a conversation, cancelling its running completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisposeParams {
    pub conversation_uri: String,
}
