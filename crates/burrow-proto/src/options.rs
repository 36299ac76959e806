//! Per-tunnel transport options

use serde::{Deserialize, Serialize};

/// How relayed bytes are wrapped on a work connection.
///
/// Both peers of a tunnel must agree on these flags and on the secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportOptions {
    /// Encrypt work connections with a key derived from `secret`
    pub use_encryption: bool,

    /// Compress work connections
    pub use_compression: bool,

    /// Pre-shared secret used for key derivation
    pub secret: String,
}

impl TransportOptions {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Default::default()
        }
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.use_encryption = enabled;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// True when no wrapper layer is applied
    pub fn is_plain(&self) -> bool {
        !self.use_encryption && !self.use_compression
    }
}
