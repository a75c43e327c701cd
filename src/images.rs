use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::ancestry;
use crate::error::{Error, Result};
use crate::storage::paths::{
    image_checksum_path, image_files_path, image_json_path, image_layer_path, image_mark_path,
};
use crate::storage::{ByteChunks, Storage};

/// Metadata returned for `GET json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJson {
    pub data: Vec<u8>,
    pub layer_size: Option<u64>,
    pub checksum: Option<String>,
}

/// Read side of the store. Nothing is served for an image that still
/// carries its mark.
pub struct Images {
    store: Arc<dyn Storage>,
}

fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl Images {
    pub fn new(store: Arc<dyn Storage>) -> Images {
        Images { store }
    }

    pub fn is_ready(&self, image_id: &str) -> Result<bool> {
        Ok(self.store.exists(&image_json_path(image_id))?
            && !self.store.exists(&image_mark_path(image_id))?)
    }

    fn require_completion(&self, image_id: &str) -> Result<()> {
        if self.store.exists(&image_mark_path(image_id))? {
            return Err(Error::UploadInProgress(image_id.to_string()));
        }
        Ok(())
    }

    pub fn get_json(&self, image_id: &str) -> Result<ImageJson> {
        self.require_completion(image_id)?;
        let data = self.store.get_content(&image_json_path(image_id))?;
        let layer_size = optional(self.store.get_size(&image_layer_path(image_id)))?;
        let checksum = optional(self.store.get_content(&image_checksum_path(image_id)))?
            .map(|sum| String::from_utf8_lossy(&sum).trim().to_string());
        Ok(ImageJson {
            data,
            layer_size,
            checksum,
        })
    }

    pub fn stream_layer(&self, image_id: &str) -> Result<ByteChunks> {
        self.require_completion(image_id)?;
        self.store.stream_read(&image_layer_path(image_id))
    }

    /// Local file holding the layer, when the backend keeps one.
    pub fn layer_file(&self, image_id: &str) -> Result<Option<PathBuf>> {
        self.require_completion(image_id)?;
        let key = image_layer_path(image_id);
        if !self.store.exists(&key)? {
            return Err(Error::NotFound(key));
        }
        Ok(self.store.local_path(&key))
    }

    pub fn get_ancestry(&self, image_id: &str) -> Result<Vec<String>> {
        self.require_completion(image_id)?;
        ancestry::read(&*self.store, image_id)
    }

    /// JSON list of the regular files in the layer archive.
    pub fn get_files(&self, image_id: &str) -> Result<Vec<u8>> {
        self.require_completion(image_id)?;
        let files_path = image_files_path(image_id);
        if let Some(files) = optional(self.store.get_content(&files_path))? {
            return Ok(files);
        }

        let files = self.list_layer_files(image_id)?;
        let data = serde_json::to_vec(&files)
            .map_err(|e| Error::InvalidRequest(format!("files of {}: {}", image_id, e)))?;
        self.store.put_content(&files_path, &data)?;
        debug!("indexed {} files for {}", files.len(), image_id);
        Ok(data)
    }

    fn list_layer_files(&self, image_id: &str) -> Result<Vec<String>> {
        let mut spool = tempfile::tempfile()?;
        for chunk in self.store.stream_read(&image_layer_path(image_id))? {
            spool.write_all(&chunk?)?;
        }
        spool.seek(SeekFrom::Start(0))?;

        let format_error = |e: std::io::Error| Error::ArchiveFormat(e.to_string());
        let mut archive = tar::Archive::new(spool);
        let mut files = Vec::new();
        for entry in archive.entries().map_err(format_error)? {
            let entry = entry.map_err(format_error)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(format_error)?;
            let name = path.to_string_lossy();
            files.push(name.strip_prefix('.').unwrap_or(&*name).to_string());
        }
        Ok(files)
    }
}
