//! Layer properties record stored next to the snapshot.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::core::error::LayerResult;
use crate::core::layer::{LayerDescriptor, LayerId, LayerRole};

/// Current properties format version.
pub const PROPERTIES_FORMAT_VERSION: u32 = 1;

/// Identifies which layer an archive holds and what it was built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerProperties {
    pub format_version: u32,
    pub layer_name: String,
    pub layer_id: LayerId,
    pub role: LayerRole,
    pub platform: String,
    pub artifact_name: String,
    /// Lowercase hex SHA-256 of the snapshot entry.
    pub snapshot_sha256: String,
    pub created_millis: u64,
}

impl LayerProperties {
    pub fn new(layer: &LayerDescriptor, platform: &str, artifact_name: &str, snapshot_sha256: String) -> Self {
        let created_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            format_version: PROPERTIES_FORMAT_VERSION,
            layer_name: layer.name.clone(),
            layer_id: layer.id,
            role: layer.role,
            platform: platform.to_string(),
            artifact_name: artifact_name.to_string(),
            snapshot_sha256,
            created_millis,
        }
    }

    pub fn layer(&self) -> LayerDescriptor {
        LayerDescriptor {
            id: self.layer_id,
            role: self.role,
            name: self.layer_name.clone(),
        }
    }

    pub fn to_json(&self) -> LayerResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> LayerResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
