use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// An uploaded firmware image plus its content digest.
///
/// Cloning is cheap; the image bytes are shared.
#[derive(Debug, Clone)]
pub struct Firmware {
    bytes: Arc<[u8]>,
    sha256: String,
}

impl Firmware {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        Self { bytes, sha256 }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn info(&self) -> FirmwareInfo {
        FirmwareInfo::new(self.sha256.clone(), self.size())
    }
}

/// Digest and size of a firmware image, as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub sha256: String,
    pub size_bytes: u64,
    /// Size in MiB, rounded to two decimals.
    pub size_mb: f64,
}

impl FirmwareInfo {
    pub fn new(sha256: String, size_bytes: u64) -> Self {
        let size_mb = (size_bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0;
        Self {
            sha256,
            size_bytes,
            size_mb,
        }
    }
}
