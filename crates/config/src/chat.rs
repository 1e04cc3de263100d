// Chat provider secrets
//
// API keys come from the environment (SQLBRIDGE_OPENAI_KEY, ...).
// Keys are NEVER stored in settings.toml

use std::env;

/// Source of an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Environment,
    None,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySource::Environment => "environment",
            KeySource::None => "none",
        }
    }
}

/// Result of key lookup
#[derive(Debug, Clone)]
pub struct KeyLookup {
    pub key: Option<String>,
    pub source: KeySource,
}

/// Get the environment variable name for a provider
pub fn env_var_name(provider: &str) -> String {
    format!("SQLBRIDGE_{}_KEY", provider.to_uppercase())
}

/// Get an API key for the specified provider from the process environment
pub fn get_api_key(provider: &str) -> KeyLookup {
    get_api_key_with(provider, |name| env::var(name).ok())
}

/// Key lookup against an arbitrary variable source. Empty values count as unset.
pub fn get_api_key_with(provider: &str, lookup: impl Fn(&str) -> Option<String>) -> KeyLookup {
    match lookup(&env_var_name(provider)) {
        Some(key) if !key.is_empty() => KeyLookup {
            key: Some(key),
            source: KeySource::Environment,
        },
        _ => KeyLookup {
            key: None,
            source: KeySource::None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("openai"), "SQLBRIDGE_OPENAI_KEY");
    }

    #[test]
    fn test_lookup_found_and_empty() {
        let found = get_api_key_with("openai", |name| {
            (name == "SQLBRIDGE_OPENAI_KEY").then(|| "sk-test".to_string())
        });
        assert_eq!(found.key.as_deref(), Some("sk-test"));
        assert_eq!(found.source, KeySource::Environment);

        let empty = get_api_key_with("openai", |_| Some(String::new()));
        assert_eq!(empty.key, None);
        assert_eq!(empty.source.as_str(), "none");
    }
}
