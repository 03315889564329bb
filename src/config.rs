//! Session configuration
//!
//! The credential and tunables are explicit inputs to a session rather
//! than ambient lookups, so sessions can be constructed independently in
//! tests. Defaults come from the embedded config.toml; the API key comes
//! from the environment (GEMINI_API_KEY, optionally via a .env file).

use serde::Deserialize;

/// Environment variable holding the service credential
pub const API_KEY_VAR: &str = "GEMINI_API_KEY";

/// Everything a live capture session needs to start
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service credential; an empty value fails `start()` with
    /// `CredentialMissing` before any device or network action
    pub api_key: String,
    /// Model resource name for the live channel
    pub model: String,
    /// Scribe-only system role sent at setup
    pub system_instruction: String,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    live: LiveDefaults,
}

#[derive(Debug, Deserialize)]
struct LiveDefaults {
    model: String,
    system_instruction: String,
}

/// Load defaults from the embedded config.toml
fn load_defaults() -> Result<LiveDefaults, toml::de::Error> {
    const CONFIG_TOML: &str = include_str!("../config.toml");
    let config: FileConfig = toml::from_str(CONFIG_TOML)?;
    Ok(config.live)
}

impl SessionConfig {
    /// Build a config from the embedded defaults and the environment
    ///
    /// A missing API key is not an error here; it surfaces as
    /// `CredentialMissing` when the session starts, so the caller can
    /// still construct and inspect the session.
    pub fn from_env() -> Result<Self, toml::de::Error> {
        let defaults = load_defaults()?;
        let api_key = std::env::var(API_KEY_VAR).unwrap_or_default();
        Ok(Self {
            api_key,
            model: defaults.model,
            system_instruction: defaults.system_instruction,
        })
    }
}
