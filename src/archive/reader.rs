//! Layer archive read path.
//!
//! Opening an archive validates it completely: properties, platform, snapshot
//! digest and snapshot contents. The archive file itself is never modified.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use super::properties::{LayerProperties, PROPERTIES_FORMAT_VERSION};
use super::snapshot::{sha256_hex, LayerSnapshot};
use super::{is_layer_file, ENTRY_ARGUMENTS, ENTRY_ENVIRONMENT, ENTRY_PROPERTIES, ENTRY_SNAPSHOT};
use crate::core::config::BuildConfig;
use crate::core::error::{LayerError, LayerResult};

/// A validated, read-only layer archive.
#[derive(Debug)]
pub struct LayerArchive {
    path: PathBuf,
    properties: LayerProperties,
    snapshot: LayerSnapshot,
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
}

fn read_entry(zip: &mut ZipArchive<File>, path: &Path, name: &str) -> LayerResult<Vec<u8>> {
    let mut entry = zip.by_name(name).map_err(|e| LayerError::InvalidArchive {
        path: path.to_path_buf(),
        reason: format!("entry '{}': {}", name, e),
    })?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn read_text_entry(zip: &mut ZipArchive<File>, path: &Path, name: &str) -> LayerResult<String> {
    String::from_utf8(read_entry(zip, path, name)?).map_err(|_| LayerError::InvalidArchive {
        path: path.to_path_buf(),
        reason: format!("entry '{}' is not valid UTF-8", name),
    })
}

impl LayerArchive {
    /// Open and validate the archive at `path` for a build using `config`.
    pub fn open(path: impl AsRef<Path>, config: &BuildConfig) -> LayerResult<Self> {
        let path = path.as_ref();
        let invalid = |reason: String| LayerError::InvalidArchive {
            path: path.to_path_buf(),
            reason,
        };

        if !is_layer_file(path) {
            return Err(invalid(format!("expected a .{} file", super::LAYER_FILE_EXTENSION)));
        }
        if !path.is_file() {
            return Err(LayerError::MissingFile {
                path: path.to_path_buf(),
            });
        }

        let mut zip = ZipArchive::new(File::open(path)?).map_err(|e| invalid(e.to_string()))?;

        let properties = LayerProperties::from_json(&read_text_entry(&mut zip, path, ENTRY_PROPERTIES)?)?;
        if properties.format_version != PROPERTIES_FORMAT_VERSION {
            return Err(invalid(format!(
                "unsupported properties format version {}",
                properties.format_version
            )));
        }
        if properties.platform != config.platform {
            return Err(LayerError::PlatformMismatch {
                expected: config.platform.clone(),
                found: properties.platform,
            });
        }

        let snapshot_bytes = read_entry(&mut zip, path, ENTRY_SNAPSHOT)?;
        if config.verify_checksums && sha256_hex(&snapshot_bytes) != properties.snapshot_sha256 {
            return Err(LayerError::corrupt("snapshot digest does not match the layer properties"));
        }
        let snapshot = LayerSnapshot::decode(&snapshot_bytes, config.verify_checksums)?;
        if snapshot.layer != properties.layer() {
            return Err(LayerError::corrupt(format!(
                "snapshot describes {} '{}' but the properties describe {} '{}'",
                snapshot.layer.id, snapshot.layer.name, properties.layer_id, properties.layer_name
            )));
        }

        let arguments = serde_json::from_str(&read_text_entry(&mut zip, path, ENTRY_ARGUMENTS)?)
            .map_err(|e| invalid(format!("entry '{}': {}", ENTRY_ARGUMENTS, e)))?;
        let environment = serde_json::from_str(&read_text_entry(&mut zip, path, ENTRY_ENVIRONMENT)?)
            .map_err(|e| invalid(format!("entry '{}': {}", ENTRY_ENVIRONMENT, e)))?;

        if zip.by_name(&properties.artifact_name).is_err() {
            return Err(invalid(format!("artifact '{}' is missing", properties.artifact_name)));
        }

        log::info!(
            "Opened {} layer '{}' ({}) from {}",
            properties.role,
            properties.layer_name,
            properties.layer_id,
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            properties,
            snapshot,
            arguments,
            environment,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn properties(&self) -> &LayerProperties {
        &self.properties
    }

    pub fn snapshot(&self) -> &LayerSnapshot {
        &self.snapshot
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Copy the compiled artifact into `dir`, returning its path there.
    pub fn extract_artifact(&self, dir: impl AsRef<Path>) -> LayerResult<PathBuf> {
        let dir = dir.as_ref();
        let mut zip = ZipArchive::new(File::open(&self.path)?).map_err(|e| LayerError::InvalidArchive {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let mut entry = zip
            .by_name(&self.properties.artifact_name)
            .map_err(|e| LayerError::InvalidArchive {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        fs::create_dir_all(dir)?;
        let dest = dir.join(&self.properties.artifact_name);
        let mut out = File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
        log::debug!("Extracted {} to {}", self.properties.artifact_name, dest.display());
        Ok(dest)
    }
}
