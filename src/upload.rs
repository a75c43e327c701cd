// The push side of an image.
//
// Writing the json creates the mark object; as long as it exists the image
// is incomplete, whatever else is stored for it, and every step may be
// retried: json, layer bytes and checksum. The mark is only removed once a
// claimed checksum matches one of the digests computed over the layer.
//
// NEW -> MARKED -> CHECKSUM_PENDING -> VERIFIED
//                \-> mismatch: still MARKED, push again
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde_json::Value;

use crate::ancestry;
use crate::checksum::{self, LayerChecksums};
use crate::error::{Error, Result};
use crate::pending::PendingUploads;
use crate::pipeline::{DigestHandler, SpoolHandler, TeeReader};
use crate::storage::paths::{
    image_checksum_path, image_json_path, image_layer_path, image_mark_path,
};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    New,
    Marked,
    /// Layer received, its digests wait for the claimed checksum.
    ChecksumPending,
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOutcome {
    /// A stored checksum matched, the image is complete.
    Verified,
    /// No checksum claimed yet, digests kept until `put_checksum`.
    Pending,
}

pub struct UploadTransaction {
    store: Arc<dyn Storage>,
    pending: PendingUploads,
}

struct ImageMeta {
    parent: Option<String>,
}

fn parse_meta(image_id: &str, data: &[u8]) -> Result<ImageMeta> {
    let object = match serde_json::from_slice::<Value>(data) {
        Ok(Value::Object(object)) => object,
        _ => return Err(Error::InvalidRequest("Invalid JSON".to_string())),
    };
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidRequest("Missing key `id' in JSON".to_string()))?;
    if id != image_id {
        return Err(Error::InvalidRequest("JSON data contains invalid id".to_string()));
    }
    let parent = object
        .get("parent")
        .and_then(Value::as_str)
        .filter(|parent| !parent.is_empty())
        .map(str::to_string);
    Ok(ImageMeta { parent })
}

impl UploadTransaction {
    pub fn new(store: Arc<dyn Storage>, pending_ttl: Duration) -> UploadTransaction {
        UploadTransaction {
            store,
            pending: PendingUploads::new(pending_ttl),
        }
    }

    pub fn state(&self, image_id: &str) -> Result<UploadState> {
        if self.store.exists(&image_mark_path(image_id))? {
            if self.pending.get(image_id).is_some() {
                Ok(UploadState::ChecksumPending)
            } else {
                Ok(UploadState::Marked)
            }
        } else if self.store.exists(&image_json_path(image_id))? {
            Ok(UploadState::Verified)
        } else {
            Ok(UploadState::New)
        }
    }

    fn is_complete(&self, key: &str, image_id: &str) -> Result<bool> {
        Ok(self.store.exists(key)? && !self.store.exists(&image_mark_path(image_id))?)
    }

    /// Starts (or restarts) the push of `image_id` with its json metadata.
    ///
    /// A checksum may be claimed up front, otherwise a checksum left over
    /// from an earlier attempt is dropped.
    pub fn put_json(&self, image_id: &str, data: &[u8], claimed: Option<&str>) -> Result<()> {
        let meta = parse_meta(image_id, data)?;
        if let Some(claimed) = claimed {
            checksum::validate_format(claimed)?;
        }
        if let Some(parent) = &meta.parent {
            if !self.store.exists(&image_json_path(parent))? {
                return Err(Error::InvalidRequest(
                    "Image depends on a non existing parent".to_string(),
                ));
            }
        }
        let json_path = image_json_path(image_id);
        if self.is_complete(&json_path, image_id)? {
            return Err(Error::AlreadyExists(image_id.to_string()));
        }

        let checksum_path = image_checksum_path(image_id);
        match claimed {
            Some(claimed) => self.store.put_content(&checksum_path, claimed.as_bytes())?,
            None => self.store.remove(&checksum_path)?,
        }
        self.pending.clear(image_id);
        self.store.put_content(&image_mark_path(image_id), b"true")?;
        self.store.put_content(&json_path, data)?;
        ancestry::build(&*self.store, image_id, meta.parent.as_deref())?;
        debug!("marked {} for upload", image_id);
        Ok(())
    }

    /// Streams the layer into the backend while computing its digests.
    pub fn put_layer(&self, image_id: &str, source: &mut dyn Read) -> Result<LayerOutcome> {
        let json = self.store.get_content(&image_json_path(image_id))?;
        let layer_path = image_layer_path(image_id);
        if self.is_complete(&layer_path, image_id)? {
            return Err(Error::AlreadyExists(image_id.to_string()));
        }

        let checksums = self.receive(&layer_path, &json, source)?;
        // replaces the digests of any earlier attempt, they no longer
        // describe the stored layer
        self.pending.record(image_id, checksums.clone());
        match self.store.get_content(&image_checksum_path(image_id)) {
            Ok(claimed) => {
                let claimed = String::from_utf8_lossy(&claimed).trim().to_string();
                self.conclude(image_id, &claimed, &checksums)?;
                Ok(LayerOutcome::Verified)
            }
            Err(Error::NotFound(_)) => {
                // not downloadable yet, the mark stays
                debug!("layer for {} waits for its checksum", image_id);
                Ok(LayerOutcome::Pending)
            }
            Err(e) => Err(e),
        }
    }

    /// Checks a claimed checksum against the digests of an uploaded layer.
    pub fn put_checksum(&self, image_id: &str, claimed: &str) -> Result<()> {
        checksum::validate_format(claimed)?;
        if !self.store.exists(&image_json_path(image_id))? {
            return Err(Error::NotFound(image_json_path(image_id)));
        }
        if !self.store.exists(&image_mark_path(image_id))? {
            return Err(Error::AlreadyExists(image_id.to_string()));
        }
        let checksums = self.pending.get(image_id).ok_or_else(|| {
            Error::InvalidRequest(format!("no layer checksum pending for image {}", image_id))
        })?;
        self.store
            .put_content(&image_checksum_path(image_id), claimed.as_bytes())?;
        self.conclude(image_id, claimed, &checksums)
    }

    fn receive(&self, layer_path: &str, seed: &[u8], source: &mut dyn Read) -> Result<LayerChecksums> {
        let mut spool = SpoolHandler::new()?;
        let mut digest = DigestHandler::new();
        {
            let mut reader = TeeReader::new(source);
            reader.add_handler(&mut spool);
            reader.add_handler(&mut digest);
            self.store.stream_write(layer_path, &mut reader)?;
        }
        debug!("received {} bytes for {}", digest.size(), layer_path);
        Ok(LayerChecksums {
            content: digest.finish(),
            archive: checksum::archive_digest(spool, seed),
        })
    }

    fn conclude(&self, image_id: &str, claimed: &str, checksums: &LayerChecksums) -> Result<()> {
        if !checksums.matches(claimed) {
            debug!(
                "wrong checksum for {}: claimed {}, computed {:?}",
                image_id,
                claimed,
                checksums.all()
            );
            return Err(Error::ChecksumMismatch {
                image_id: image_id.to_string(),
                claimed: claimed.to_string(),
            });
        }
        self.store.remove(&image_mark_path(image_id))?;
        self.pending.clear(image_id);
        info!("image {} verified", image_id);
        Ok(())
    }
}
