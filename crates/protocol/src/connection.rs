//! `connection/*` params and results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a connection is used for. An owner URI may hold one live connection
/// per purpose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionPurpose {
    #[default]
    Default,
    Query,
    Edit,
    ObjectExplorer,
    SchemaDesigner,
    Chat,
}

impl ConnectionPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPurpose::Default => "default",
            ConnectionPurpose::Query => "query",
            ConnectionPurpose::Edit => "edit",
            ConnectionPurpose::ObjectExplorer => "objectExplorer",
            ConnectionPurpose::SchemaDesigner => "schemaDesigner",
            ConnectionPurpose::Chat => "chat",
        }
    }
}

/// Connection target as sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    /// Driver name (`sqlite`, ...). Falls back to the host default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub server_name: String,
    /// Database name; a file path (or `:memory:`) for SQLite.
    #[serde(default)]
    pub database_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// `SqlLogin`, `Integrated`, `AzureMFA`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_account_token: Option<String>,
    /// Driver-specific extras, passed through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub owner_uri: String,
    pub connection: ConnectionDetails,
    #[serde(rename = "type", default)]
    pub purpose: ConnectionPurpose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub provider: String,
    pub server_version: String,
    pub dialect: String,
}

/// Sent once per `connection/connect`, after the open succeeds or fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCompleteParams {
    pub owner_uri: String,
    #[serde(rename = "type")]
    pub purpose: ConnectionPurpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectParams {
    pub owner_uri: String,
    /// Omitted: drop every connection of the owner.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<ConnectionPurpose>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferParams {
    pub old_owner_uri: String,
    pub new_owner_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDatabasesParams {
    pub owner_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDatabasesResult {
    pub database_names: Vec<String>,
}

/// Params of the server → client `connection/fetchAzureToken` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchAzureTokenParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub server_name: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchAzureTokenResult {
    pub token: String,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<i64>,
}
