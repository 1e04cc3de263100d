//! Method names. These strings are the compatibility surface with editor
//! clients and must not change.

// =============================================================================
// Host lifecycle
// =============================================================================

pub const SHUTDOWN: &str = "shutdown";
pub const EXIT: &str = "exit";

// =============================================================================
// Connection
// =============================================================================

pub const CONNECTION_CONNECT: &str = "connection/connect";
pub const CONNECTION_COMPLETE: &str = "connection/complete";
pub const CONNECTION_DISCONNECT: &str = "connection/disconnect";
pub const CONNECTION_TRANSFER: &str = "connection/transfer";
pub const CONNECTION_LIST_DATABASES: &str = "connection/listDatabases";
/// Server → client request.
pub const CONNECTION_FETCH_AZURE_TOKEN: &str = "connection/fetchAzureToken";

// =============================================================================
// Object explorer
// =============================================================================

pub const OBJECT_EXPLORER_CREATE_SESSION: &str = "objectexplorer/createsession";
pub const OBJECT_EXPLORER_SESSION_CREATED: &str = "objectexplorer/sessioncreated";
pub const OBJECT_EXPLORER_EXPAND: &str = "objectexplorer/expand";
pub const OBJECT_EXPLORER_REFRESH: &str = "objectexplorer/refresh";
pub const OBJECT_EXPLORER_EXPAND_COMPLETED: &str = "objectexplorer/expandCompleted";
pub const OBJECT_EXPLORER_CLOSE_SESSION: &str = "objectexplorer/closesession";

// =============================================================================
// Schema designer
// =============================================================================

pub const SCHEMA_DESIGNER_CREATE_SESSION: &str = "schemaDesigner/createSession";
pub const SCHEMA_DESIGNER_SESSION_CREATED: &str = "schemaDesigner/sessionCreated";
pub const SCHEMA_DESIGNER_GET_SCHEMA_MODEL: &str = "schemaDesigner/getSchemaModel";
pub const SCHEMA_DESIGNER_SCHEMA_MODEL: &str = "schemaDesigner/schemaModel";
pub const SCHEMA_DESIGNER_GENERATE_SCRIPT: &str = "schemaDesigner/generateScript";
pub const SCHEMA_DESIGNER_CLOSE_SESSION: &str = "schemaDesigner/closeSession";

// =============================================================================
// Query
// =============================================================================

pub const QUERY_EXECUTE_STRING: &str = "query/executeString";
pub const QUERY_MESSAGE: &str = "query/message";
pub const QUERY_COMPLETE: &str = "query/complete";
pub const QUERY_SUBSET: &str = "query/subset";
pub const QUERY_CANCEL: &str = "query/cancel";
pub const QUERY_DISPOSE: &str = "query/dispose";

// =============================================================================
// Edit data
// =============================================================================

pub const EDIT_INITIALIZE: &str = "edit/initialize";
pub const EDIT_SESSION_READY: &str = "edit/sessionReady";
pub const EDIT_SUBSET: &str = "edit/subset";
pub const EDIT_CREATE_ROW: &str = "edit/createRow";
pub const EDIT_UPDATE_CELL: &str = "edit/updateCell";
pub const EDIT_DELETE_ROW: &str = "edit/deleteRow";
pub const EDIT_REVERT_ROW: &str = "edit/revertRow";
pub const EDIT_REVERT_CELL: &str = "edit/revertCell";
pub const EDIT_COMMIT: &str = "edit/commit";
pub const EDIT_COMMIT_PROGRESS: &str = "edit/commitProgress";
pub const EDIT_DISPOSE: &str = "edit/dispose";

// =============================================================================
// Chat
// =============================================================================

pub const CHAT_COMPLETION_REQUEST: &str = "chat/completion-request";
pub const CHAT_PROGRESS_UPDATE: &str = "chat/progress-update";
pub const CHAT_COMPLETION_RESULT: &str = "chat/completion-result";
pub const CHAT_DISPOSE: &str = "chat/dispose";
