//! Build configuration shared by the registries and the archive.
//!
//! Configuration is a plain struct with defaults for the host. A few knobs can
//! be overridden from the environment so the build driver does not have to
//! thread them through every invocation.

use super::error::{LayerError, LayerResult};

/// Environment variable selecting the compressed reference shift.
pub const ENV_COMPRESSION_SHIFT: &str = "LAYER_REF_COMPRESSION_SHIFT";

/// Environment variable disabling snapshot checksum verification.
pub const ENV_SKIP_CHECKSUM: &str = "LAYER_SKIP_CHECKSUM";

/// Reference compression discipline for heap reads.
///
/// When enabled, references are stored as 32-bit offsets from the heap base,
/// shifted right by `shift`. Loads through the relocatable constant table
/// decompress exactly like ordinary heap reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReferenceCompression {
    pub enabled: bool,
    pub shift: u8,
}

impl ReferenceCompression {
    pub const fn uncompressed() -> Self {
        Self { enabled: false, shift: 0 }
    }

    pub const fn with_shift(shift: u8) -> Self {
        Self { enabled: true, shift }
    }

    /// Size in bytes of one stored reference.
    pub fn reference_size(&self) -> u32 {
        if self.enabled {
            4
        } else {
            8
        }
    }

    /// Encode an absolute address for storage in the heap. `None` when a
    /// compressed reference would point below the heap base.
    pub fn compress(&self, address: u64, heap_base: u64) -> Option<u64> {
        if self.enabled {
            address.checked_sub(heap_base).map(|offset| offset >> self.shift)
        } else {
            Some(address)
        }
    }

    /// Decode a stored reference back to an absolute address.
    pub fn decompress(&self, stored: u64, heap_base: u64) -> u64 {
        if self.enabled {
            heap_base + (stored << self.shift)
        } else {
            stored
        }
    }
}

/// Configuration for one layer build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub reference_compression: ReferenceCompression,
    /// Platform identifier recorded in and checked against layer properties.
    pub platform: String,
    pub verify_checksums: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            reference_compression: ReferenceCompression::uncompressed(),
            platform: host_platform(),
            verify_checksums: true,
        }
    }
}

impl BuildConfig {
    /// Defaults overridden by `LAYER_*` environment variables.
    pub fn from_env() -> LayerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LayerResult<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_COMPRESSION_SHIFT) {
            let shift: u8 = raw.trim().parse().map_err(|_| LayerError::MalformedLayerOption {
                option: format!("{}={}", ENV_COMPRESSION_SHIFT, raw),
                reason: "expected a shift between 0 and 4".into(),
            })?;
            if shift > 4 {
                return Err(LayerError::MalformedLayerOption {
                    option: format!("{}={}", ENV_COMPRESSION_SHIFT, raw),
                    reason: "expected a shift between 0 and 4".into(),
                });
            }
            config.reference_compression = ReferenceCompression::with_shift(shift);
        }

        if let Some(raw) = lookup(ENV_SKIP_CHECKSUM) {
            config.verify_checksums = !matches!(raw.trim(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Stride between two slots of the relocatable constant table.
    pub fn element_stride(&self) -> u32 {
        self.reference_compression.reference_size()
    }
}

/// `<os>-<arch>` of the running host.
pub fn host_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}
