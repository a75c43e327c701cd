// The two digests a layer is verified against: sha256 over the bytes as
// received, and tarsum over the archive contents seeded with the image json.
// Either one matching the claimed checksum counts as verified.
use std::fs::File;
use std::sync::OnceLock;

use log::debug;
use regex::Regex;

use crate::error::{Error, Result};
use crate::pipeline::SpoolHandler;

pub mod tarsum;

/// Digests computed while a layer streamed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerChecksums {
    pub content: String,
    /// Missing when the layer is not a readable archive.
    pub archive: Option<String>,
}

impl LayerChecksums {
    pub fn all(&self) -> Vec<String> {
        let mut sums = vec![self.content.clone()];
        sums.extend(self.archive.clone());
        sums
    }

    pub fn matches(&self, claimed: &str) -> bool {
        verify(claimed, &self.all())
    }
}

pub fn verify(claimed: &str, computed: &[String]) -> bool {
    computed.iter().any(|sum| sum == claimed)
}

/// Tarsum of a spooled layer. Failures are logged and give `None`, the
/// content digest alone is then used for verification.
pub fn archive_digest(spool: SpoolHandler, seed: &[u8]) -> Option<String> {
    let computed = spool
        .into_file()
        .map_err(Error::from)
        .and_then(|file: File| tarsum::tarsum(file, seed));
    match computed {
        Ok(sum) => Some(sum),
        Err(e) => {
            debug!("no archive digest: {}", e);
            None
        }
    }
}

/// Claimed checksums look like `<algorithm>:<hex>`.
pub fn validate_format(checksum: &str) -> Result<()> {
    static FORMAT: OnceLock<Option<Regex>> = OnceLock::new();
    let format = FORMAT.get_or_init(|| Regex::new(r"^[A-Za-z0-9+._-]+:[0-9a-fA-F]+$").ok());
    if format.as_ref().map_or(false, |format| format.is_match(checksum)) {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!(
            "invalid checksum format {:?}",
            checksum
        )))
    }
}
