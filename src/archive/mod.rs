// This module implements the layer archive, the on-disk bundle that carries one layer's
// output to the next layer's build process. An archive is a zip container holding the
// builder arguments, the builder environment, the binary snapshot of the registries, a
// JSON properties record identifying the layer and its platform, and the compiled
// artifact. Archives are written atomically through a temporary file in the destination
// directory and are read-only input for every later layer. This module also owns the
// naming rules shared by the writer and the layer option parser: the reserved file
// extension and the shared-library name prefix required of initial and shared layers.

//! Layer archive format and naming rules.

pub mod options;
pub mod properties;
pub mod reader;
pub mod snapshot;
pub mod writer;

use std::path::Path;

use crate::core::error::{LayerError, LayerResult};
use crate::core::layer::LayerRole;

pub use options::LayerOption;
pub use properties::LayerProperties;
pub use reader::LayerArchive;
pub use snapshot::LayerSnapshot;
pub use writer::LayerArchiveWriter;

/// Reserved extension of layer archive files, without the dot.
pub const LAYER_FILE_EXTENSION: &str = "nil";

/// Prefix every initial and shared layer name must carry.
pub const SHARED_LAYER_PREFIX: &str = "lib";

pub(crate) const ENTRY_ARGUMENTS: &str = "builder.args";
pub(crate) const ENTRY_ENVIRONMENT: &str = "builder.env";
pub(crate) const ENTRY_SNAPSHOT: &str = "layer.snapshot";
pub(crate) const ENTRY_PROPERTIES: &str = "layer.properties";

/// Entry names the artifact may not use.
pub(crate) const RESERVED_ENTRIES: [&str; 4] = [ENTRY_ARGUMENTS, ENTRY_ENVIRONMENT, ENTRY_SNAPSHOT, ENTRY_PROPERTIES];

/// Whether `path` names a layer archive file.
pub fn is_layer_file(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    let has_stem = path.file_stem().is_some_and(|stem| !stem.is_empty());
    has_stem && path.extension().is_some_and(|ext| ext == LAYER_FILE_EXTENSION)
}

/// File name of the archive for layer `name`.
pub fn layer_file_name(name: &str) -> String {
    format!("{}.{}", name, LAYER_FILE_EXTENSION)
}

/// Check `name` against the naming convention for `role`.
pub fn validate_layer_name(name: &str, role: LayerRole) -> LayerResult<()> {
    let invalid = |reason: &str| LayerError::InvalidLayerName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if role == LayerRole::Application {
        return Ok(());
    }

    let rest = name
        .strip_prefix(SHARED_LAYER_PREFIX)
        .ok_or_else(|| invalid("initial and shared layer names must start with 'lib'"))?;
    if rest.is_empty() {
        return Err(invalid("expected at least one character after 'lib'"));
    }
    if !rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(invalid("only letters, digits, '_' and '-' may follow 'lib'"));
    }
    Ok(())
}
