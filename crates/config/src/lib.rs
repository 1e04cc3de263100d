// Configuration loading

pub mod chat;
pub mod settings;

pub use settings::{
    ChatProvider, ChatSettings, EditSettings, LoggingSettings, QuerySettings, ServerSettings,
    Settings, SettingsError,
};
