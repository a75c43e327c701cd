use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;

use log::{debug, info};

use super::paths::normalize;
use super::{ByteChunks, ChunkReader, Keys, Storage};
use crate::error::{Error, Result};
use crate::multipart::{self, MultipartClient};

/// One page of a delimited listing.
#[derive(Debug, Default, Clone)]
pub struct ListPage {
    /// Object keys and common prefixes, backend-rooted.
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

/// Everything an object store has to offer on top of the multipart calls.
pub trait ObjectClient: MultipartClient {
    fn get_object(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Object size, `Error::NotFound` for a missing key.
    fn head_object(&self, bucket: &str, key: &str) -> Result<u64>;

    /// Succeeds for missing keys.
    fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Keys one level below `prefix`, which ends with the delimiter.
    fn list_page(&self, bucket: &str, prefix: &str, token: Option<&str>) -> Result<ListPage>;
}

/// Backend over an object store bucket, keys rooted under a prefix.
pub struct RemoteStorage<C> {
    client: Arc<C>,
    bucket: String,
    root: String,
    chunk_size: usize,
}

impl<C: ObjectClient> RemoteStorage<C> {
    pub fn new(client: C, bucket: &str, root: &str, chunk_size: usize) -> RemoteStorage<C> {
        let min = client.min_part_size();
        let chunk_size = if chunk_size < min {
            info!(
                "chunk size {} below the backend minimum, using {}",
                chunk_size, min
            );
            min
        } else {
            chunk_size
        };
        RemoteStorage {
            client: Arc::new(client),
            bucket: bucket.to_string(),
            root: root.trim_matches('/').to_string(),
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn key(&self, key: &str) -> String {
        normalize(&self.root, key)
    }
}

// Maps a backend-rooted key back into the logical namespace.
fn logical(root: &str, full: &str) -> String {
    let full = full.trim_end_matches('/');
    if root.is_empty() {
        return full.to_string();
    }
    full.strip_prefix(root)
        .map(|rest| rest.trim_start_matches('/').to_string())
        .unwrap_or_else(|| full.to_string())
}

impl<C: ObjectClient + 'static> Storage for RemoteStorage<C> {
    fn get_content(&self, key: &str) -> Result<Vec<u8>> {
        let mut reader = self.client.get_object(&self.bucket, &self.key(key))?;
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
        Ok(content)
    }

    fn put_content(&self, key: &str, content: &[u8]) -> Result<()> {
        self.client
            .put_object(&self.bucket, &self.key(key), content.to_vec())
    }

    fn stream_read(&self, key: &str) -> Result<ByteChunks> {
        let full = self.key(key);
        let reader = self.client.get_object(&self.bucket, &full)?;
        Ok(Box::new(ChunkReader::new(reader, &full)))
    }

    fn stream_write(&self, key: &str, source: &mut dyn Read) -> Result<()> {
        let full = self.key(key);
        let parts = multipart::upload(&*self.client, &self.bucket, &full, source, self.chunk_size)?;
        debug!("wrote {} in {} parts", full, parts);
        Ok(())
    }

    fn list_directory(&self, prefix: &str) -> Result<Keys> {
        let mut full = self.key(prefix);
        if !full.is_empty() && !full.ends_with('/') {
            full.push('/');
        }
        // the first page is fetched eagerly so a missing prefix is reported here
        let first = self.client.list_page(&self.bucket, &full, None)?;
        if first.keys.is_empty() && first.next_token.is_none() {
            return Err(Error::NotFound(prefix.to_string()));
        }
        let listing = Listing {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            prefix: full,
            buffered: first.keys.into_iter().collect(),
            next_token: first.next_token,
        };
        let root = self.root.clone();
        Ok(Box::new(listing.map(move |key| key.map(|key| logical(&root, &key)))))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        match self.client.head_object(&self.bucket, &self.key(key)) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.client.delete_object(&self.bucket, &self.key(key))
    }

    fn get_size(&self, key: &str) -> Result<u64> {
        self.client.head_object(&self.bucket, &self.key(key))
    }
}

// Lazily walks continuation tokens.
struct Listing<C> {
    client: Arc<C>,
    bucket: String,
    prefix: String,
    buffered: VecDeque<String>,
    next_token: Option<String>,
}

impl<C: ObjectClient> Iterator for Listing<C> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffered.pop_front() {
                return Some(Ok(key));
            }
            let token = self.next_token.take()?;
            match self.client.list_page(&self.bucket, &self.prefix, Some(&token)) {
                Ok(page) => {
                    self.buffered.extend(page.keys);
                    self.next_token = page.next_token;
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
