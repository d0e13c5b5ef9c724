//! Layer archive write path.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::properties::LayerProperties;
use super::snapshot::{sha256_hex, LayerSnapshot};
use super::{
    layer_file_name, validate_layer_name, ENTRY_ARGUMENTS, ENTRY_ENVIRONMENT, ENTRY_PROPERTIES, ENTRY_SNAPSHOT,
    RESERVED_ENTRIES,
};
use crate::core::error::{LayerError, LayerResult};

/// Bundles a layer's output into an archive file.
#[derive(Debug, Clone)]
pub struct LayerArchiveWriter {
    output_dir: PathBuf,
    platform: String,
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
}

impl LayerArchiveWriter {
    pub fn new(output_dir: impl Into<PathBuf>, platform: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            platform: platform.into(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
        }
    }

    /// Builder arguments recorded in the archive.
    pub fn arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    /// Builder environment recorded in the archive.
    pub fn environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path the archive for `layer_name` is written to.
    pub fn archive_path(&self, layer_name: &str) -> PathBuf {
        self.output_dir.join(layer_file_name(layer_name))
    }

    /// Write the archive for `snapshot`'s layer with `artifact` as its
    /// compiled binary. Returns the archive path.
    pub fn write(&self, snapshot: &LayerSnapshot, artifact: &Path) -> LayerResult<PathBuf> {
        let layer = &snapshot.layer;
        if !layer.role.produces_archive() {
            return Err(LayerError::InvalidLayerName {
                name: layer.name.clone(),
                reason: "an application layer does not produce a layer archive".into(),
            });
        }
        validate_layer_name(&layer.name, layer.role)?;

        let dest = self.archive_path(&layer.name);
        let not_writable = |reason: String| LayerError::NotWritable {
            path: dest.clone(),
            reason,
        };

        if !artifact.is_file() {
            return Err(LayerError::MissingFile {
                path: artifact.to_path_buf(),
            });
        }
        let artifact_name = artifact
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| LayerError::MissingFile {
                path: artifact.to_path_buf(),
            })?;
        if RESERVED_ENTRIES.contains(&artifact_name) {
            return Err(not_writable(format!("artifact name '{}' is reserved", artifact_name)));
        }

        if !self.output_dir.is_dir() {
            return Err(not_writable("output directory does not exist".into()));
        }

        let snapshot_bytes = snapshot.encode();
        let properties = LayerProperties::new(layer, &self.platform, artifact_name, sha256_hex(&snapshot_bytes));
        let properties_json = properties.to_json()?;
        let artifact_bytes = fs::read(artifact)?;
        let arguments = serde_json::to_string_pretty(&self.arguments)?;
        let environment = serde_json::to_string_pretty(&self.environment)?;

        let mut tmp = NamedTempFile::new_in(&self.output_dir).map_err(|e| not_writable(e.to_string()))?;
        {
            let mut zip = ZipWriter::new(&mut tmp);
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            let zip_err = |e: zip::result::ZipError| not_writable(e.to_string());

            let entries: [(&str, &[u8]); 5] = [
                (ENTRY_ARGUMENTS, arguments.as_bytes()),
                (ENTRY_ENVIRONMENT, environment.as_bytes()),
                (ENTRY_SNAPSHOT, snapshot_bytes.as_slice()),
                (ENTRY_PROPERTIES, properties_json.as_bytes()),
                (artifact_name, artifact_bytes.as_slice()),
            ];
            for (name, bytes) in entries {
                zip.start_file(name, options).map_err(zip_err)?;
                zip.write_all(bytes).map_err(|e| not_writable(e.to_string()))?;
            }
            zip.finish().map_err(zip_err)?;
        }

        tmp.persist(&dest).map_err(|e| not_writable(e.error.to_string()))?;
        log::info!(
            "Wrote {} layer '{}' ({}) to {}",
            layer.role,
            layer.name,
            layer.id,
            dest.display()
        );
        Ok(dest)
    }
}
