//! Layer identity and roles.
//!
//! A build chain is an Initial layer, zero or more Shared layers and a final
//! Application layer. Each layer is built by its own process.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{LayerError, LayerResult};

/// Ordinal position of a layer in the build chain. The Initial layer is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(pub u32);

impl LayerId {
    pub const INITIAL: LayerId = LayerId(0);

    /// The id of the layer built on top of this one. A prior id at the top
    /// of the range can only come from a damaged snapshot.
    pub fn next(self) -> LayerResult<LayerId> {
        self.0
            .checked_add(1)
            .map(LayerId)
            .ok_or_else(|| LayerError::corrupt(format!("{} has no successor", self)))
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer{}", self.0)
    }
}

/// Role of a layer in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerRole {
    Initial,
    Shared,
    Application,
}

impl LayerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            LayerRole::Initial => "initial",
            LayerRole::Shared => "shared",
            LayerRole::Application => "application",
        }
    }

    pub fn parse(s: &str) -> Option<LayerRole> {
        match s {
            "initial" => Some(LayerRole::Initial),
            "shared" => Some(LayerRole::Shared),
            "application" => Some(LayerRole::Application),
            _ => None,
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            LayerRole::Initial => 0,
            LayerRole::Shared => 1,
            LayerRole::Application => 2,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<LayerRole> {
        match b {
            0 => Some(LayerRole::Initial),
            1 => Some(LayerRole::Shared),
            2 => Some(LayerRole::Application),
            _ => None,
        }
    }

    /// Whether a layer with this role produces an archive for later layers.
    pub fn produces_archive(self) -> bool {
        !matches!(self, LayerRole::Application)
    }
}

impl fmt::Display for LayerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the layer currently being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub id: LayerId,
    pub role: LayerRole,
    pub name: String,
}

impl LayerDescriptor {
    /// The layer that starts a chain.
    pub fn initial(name: impl Into<String>) -> Self {
        Self {
            id: LayerId::INITIAL,
            role: LayerRole::Initial,
            name: name.into(),
        }
    }

    /// A layer built on top of `prior`.
    pub fn on_top_of(prior: &LayerDescriptor, role: LayerRole, name: impl Into<String>) -> LayerResult<Self> {
        let name = name.into();
        if role == LayerRole::Initial {
            return Err(LayerError::InvalidLayerName {
                name,
                reason: "an initial layer cannot be built on top of another layer".into(),
            });
        }
        if !prior.role.produces_archive() {
            return Err(LayerError::InvalidLayerName {
                name,
                reason: format!("'{}' is an application layer and terminates the chain", prior.name),
            });
        }
        Ok(Self {
            id: prior.id.next()?,
            role,
            name,
        })
    }
}
