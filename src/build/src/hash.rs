//! SHA-256 helpers and the `Digest` type used for every content address
//! in the build engine (layers, blobs, context entries, images).

use std::io::Read;
use std::path::Path;

use a3s_forge_core::error::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

const SHA256_PREFIX: &str = "sha256:";

/// A prefixed SHA-256 content address, e.g. `sha256:2cf24d...`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Digest of raw bytes.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(format!("{}{}", SHA256_PREFIX, sha256_bytes(data)))
    }

    /// Wrap an already computed hex digest.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ForgeError::CacheError(format!(
                "Invalid sha256 hex digest: {}",
                hex
            )));
        }
        Ok(Self(format!("{}{}", SHA256_PREFIX, hex.to_ascii_lowercase())))
    }

    /// Parse a prefixed digest string.
    pub fn parse(s: &str) -> Result<Self> {
        match s.strip_prefix(SHA256_PREFIX) {
            Some(hex) => Self::from_hex(hex),
            None => Err(ForgeError::CacheError(format!(
                "Digest must start with '{}': {}",
                SHA256_PREFIX, s
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }

    /// Filesystem-safe name: `sha256:abc` → `sha256_abc`.
    pub fn to_file_name(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = ForgeError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// Compute SHA256 digest of raw bytes (hex string).
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute SHA256 digest of everything readable from `reader` (hex string).
pub fn sha256_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of a file (hex string).
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path).map_err(|e| ForgeError::ContextError {
        path: path.to_path_buf(),
        message: format!("Failed to open file for hashing: {}", e),
    })?;
    sha256_reader(std::io::BufReader::new(file)).map_err(|e| ForgeError::ContextError {
        path: path.to_path_buf(),
        message: format!("Failed to read file for hashing: {}", e),
    })
}
