//! Bridge configuration file.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::oauth::OAuthConfig;
use crate::sts::StsConfig;

/// Top-level configuration: one STS and one OAuth provider.
///
/// The `oauth` section may be left out when only WS-Trust exchange is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    pub sts: StsConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

impl BridgeConfig {
    /// Load a JSON configuration file and validate its `sts` section.
    ///
    /// The `oauth` section is checked by [`BridgeConfig::validate`] before
    /// the OAuth side is built.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: BridgeConfig = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config
            .sts
            .validate()
            .map_err(|e| format!("sts: {}", e))
            .map_err(|e| anyhow!("Invalid configuration in {:?}: {}", path, e))?;
        Ok(config)
    }

    /// Validate both sections.
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.sts.validate().map_err(|e| format!("sts: {}", e))?;
        self.oauth.validate().map_err(|e| format!("oauth: {}", e))?;
        Ok(())
    }
}
