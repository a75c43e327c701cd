// Storage is responsible for:
// keeping opaque objects under flat, path-like keys
// (images/<id>/layer, images/<id>/json, ...)
//
// Every backend implements the same contract; callers never branch on which
// one they got, except the http layer for direct file serving.
use std::io::Read;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub mod cache;
pub mod local;
pub mod paths;
pub mod remote;
pub mod s3;

pub use cache::{CachePolicy, CachedStorage, ContentCache, MetadataOnly};
pub use local::LocalStorage;
pub use remote::{ObjectClient, RemoteStorage};
pub use s3::S3Client;

/// Read size used when streaming objects out.
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Finite sequence of byte chunks. Not resumable, call `stream_read` again.
pub type ByteChunks = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

/// Finite sequence of logical keys.
pub type Keys = Box<dyn Iterator<Item = Result<String>> + Send>;

pub trait Storage: Send + Sync {
    /// Whole object at `key`, `Error::NotFound` if there is none.
    fn get_content(&self, key: &str) -> Result<Vec<u8>>;

    /// Full overwrite. Parent structure is created implicitly.
    fn put_content(&self, key: &str, content: &[u8]) -> Result<()>;

    fn stream_read(&self, key: &str) -> Result<ByteChunks>;

    /// Consumes `source` until exhaustion. The object only becomes visible
    /// under `key` once the whole source has been written.
    fn stream_write(&self, key: &str, source: &mut dyn Read) -> Result<()>;

    /// Keys one level below `prefix`.
    fn list_directory(&self, prefix: &str) -> Result<Keys>;

    /// Never fails for a missing key.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Idempotent, removing a missing key is fine.
    fn remove(&self, key: &str) -> Result<()>;

    fn get_size(&self, key: &str) -> Result<u64>;

    /// Path on the local filesystem, for backends that have one.
    fn local_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }
}

/// Turns any reader into a `ByteChunks` sequence.
pub struct ChunkReader<R> {
    inner: R,
    key: String,
    done: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R, key: &str) -> ChunkReader<R> {
        ChunkReader {
            inner,
            key: key.to_string(),
            done: false,
        }
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Some(Ok(buf));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(Error::from_io(e, &self.key)));
                }
            }
        }
    }
}

/// The backend kinds this service knows about, picked once at startup.
pub enum Backend {
    Local(LocalStorage),
    S3(RemoteStorage<S3Client>),
}

impl Backend {
    fn inner(&self) -> &dyn Storage {
        match self {
            Backend::Local(storage) => storage,
            Backend::S3(storage) => storage,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Local(_) => "local",
            Backend::S3(_) => "s3",
        }
    }
}

impl Storage for Backend {
    fn get_content(&self, key: &str) -> Result<Vec<u8>> {
        self.inner().get_content(key)
    }

    fn put_content(&self, key: &str, content: &[u8]) -> Result<()> {
        self.inner().put_content(key, content)
    }

    fn stream_read(&self, key: &str) -> Result<ByteChunks> {
        self.inner().stream_read(key)
    }

    fn stream_write(&self, key: &str, source: &mut dyn Read) -> Result<()> {
        self.inner().stream_write(key, source)
    }

    fn list_directory(&self, prefix: &str) -> Result<Keys> {
        self.inner().list_directory(prefix)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner().exists(key)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner().remove(key)
    }

    fn get_size(&self, key: &str) -> Result<u64> {
        self.inner().get_size(key)
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.inner().local_path(key)
    }
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    fn get_content(&self, key: &str) -> Result<Vec<u8>> {
        (**self).get_content(key)
    }

    fn put_content(&self, key: &str, content: &[u8]) -> Result<()> {
        (**self).put_content(key, content)
    }

    fn stream_read(&self, key: &str) -> Result<ByteChunks> {
        (**self).stream_read(key)
    }

    fn stream_write(&self, key: &str, source: &mut dyn Read) -> Result<()> {
        (**self).stream_write(key, source)
    }

    fn list_directory(&self, prefix: &str) -> Result<Keys> {
        (**self).list_directory(prefix)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn get_size(&self, key: &str) -> Result<u64> {
        (**self).get_size(key)
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        (**self).local_path(key)
    }
}

/// Reads a whole chunk sequence into memory.
pub fn collect_chunks(chunks: ByteChunks) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for chunk in chunks {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_reader_splits_and_ends() {
        let data = vec![7u8; BUFFER_SIZE + 10];
        let chunks: Vec<Vec<u8>> = ChunkReader::new(&data[..], "k")
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), BUFFER_SIZE);
        assert_eq!(chunks[1].len(), 10);
    }

    #[test]
    fn empty_reader_has_no_chunks() {
        assert_eq!(ChunkReader::new(std::io::empty(), "k").count(), 0);
    }
}
