//! Layers and the cache keys that address them.

use a3s_forge_core::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::Digest;
use crate::instruction::Instruction;

/// Reference to a stored filesystem delta.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub digest: Digest,
    pub size: u64,
}

/// Filesystem change produced by executing an instruction.
///
/// The content is opaque to the engine; it is stored as a blob and handed
/// back to the executor as part of later steps' parent chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// The instruction changed nothing on disk
    Empty,
    /// Serialized change set (e.g. a tar stream)
    Bytes(Vec<u8>),
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(bytes) => bytes.is_empty(),
        }
    }
}

/// Inputs that fully determine a layer.
///
/// Two keys with the same fields are cache-equivalent; nothing time- or
/// host-dependent takes part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheKey {
    pub parent: Option<Digest>,
    pub kind: &'static str,
    /// Hex SHA256 of the serialized instruction
    pub payload: String,
    /// Sorted `path=digest` entries of the context slice the instruction
    /// reads, or the source stage tip for `COPY --from`
    pub context: Vec<String>,
}

impl CacheKey {
    pub fn new(
        parent: Option<&Digest>,
        instruction: &Instruction,
        context: Vec<String>,
    ) -> Result<Self> {
        Ok(Self {
            parent: parent.cloned(),
            kind: instruction.kind(),
            payload: instruction.payload_digest()?,
            context,
        })
    }

    /// The layer hash derived from this key.
    pub fn digest(&self) -> Result<Digest> {
        let canonical = serde_json::to_vec(self)?;
        Ok(Digest::of_bytes(&canonical))
    }
}

/// An immutable link in a stage's layer chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub hash: Digest,
    pub parent: Option<Digest>,
    pub produced_by: Instruction,
    /// `None` for empty layers
    pub delta: Option<BlobRef>,
    pub created_at: DateTime<Utc>,
}

impl Layer {
    /// Size of the layer's delta in bytes.
    pub fn size(&self) -> u64 {
        self.delta.as_ref().map(|b| b.size).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.delta.is_none()
    }
}
