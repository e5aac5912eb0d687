//! Marker configuration stamped into every patched archive
//!
//! The same JSON document is written to `assets/lspatch/config.json` and,
//! base64 encoded, to the `lspatch` manifest meta-data. The loader and the
//! manager read it to find the loading mode and whether an update is due.

use crate::apk::policy::BypassLevel;
use crate::apk::signing::Schemes;
use crate::exceptions::{PatchError, Result};
use crate::version::{API_CODE, VERSION, VERSION_CODE};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Engine that produced an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspConfig {
    pub version_name: String,
    pub version_code: u32,
    pub api_code: u32,
}

impl LspConfig {
    /// This engine
    pub fn current() -> Self {
        LspConfig {
            version_name: VERSION.to_string(),
            version_code: VERSION_CODE,
            api_code: API_CODE,
        }
    }
}

impl Default for LspConfig {
    fn default() -> Self {
        LspConfig::current()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchConfig {
    pub use_manager: bool,
    pub debuggable: bool,
    pub override_version_code: bool,
    pub sig_bypass_level: BypassLevel,
    pub v1: bool,
    pub v2: bool,
    #[serde(default)]
    pub v3: bool,
    #[serde(default)]
    pub original_version_code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_component_factory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_dex: Option<String>,
    #[serde(default)]
    pub lsp_config: LspConfig,
}

impl PatchConfig {
    pub fn schemes(&self) -> Schemes {
        Schemes {
            v1: self.v1,
            v2: self.v2,
            v3: self.v3,
        }
    }

    /// Meta-data value: base64 of the JSON document
    pub fn to_marker(&self) -> Result<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    pub fn from_marker(marker: &str) -> Result<Self> {
        let json = BASE64
            .decode(marker.trim())
            .map_err(|e| PatchError::MalformedManifest(format!("marker is not base64: {e}")))?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Content of the config asset
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Produced by an engine older than this one
    pub fn is_outdated(&self) -> bool {
        self.lsp_config.version_code < VERSION_CODE
    }
}
