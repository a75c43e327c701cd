use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::debug;
use tempfile::NamedTempFile;

use super::paths::normalize;
use super::{ByteChunks, ChunkReader, Keys, Storage};
use crate::error::{Error, Result};

/// Objects are plain files below `root`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<LocalStorage> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        let relative = normalize("", key);
        if relative.split('/').any(|segment| segment == "..") {
            return Err(Error::InvalidRequest(format!("invalid key {}", key)));
        }
        Ok(self.root.join(relative))
    }

    // Writes into a temp file next to the destination and renames it into
    // place, so readers never see a partially written object.
    fn write_atomic(&self, key: &str, source: &mut dyn Read) -> Result<()> {
        let path = self.path(key)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        let written = std::io::copy(source, tmp.as_file_mut())?;
        tmp.as_file_mut().flush()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        debug!("wrote {} bytes to {}", written, path.display());
        Ok(())
    }
}

impl Storage for LocalStorage {
    fn get_content(&self, key: &str) -> Result<Vec<u8>> {
        fs::read(self.path(key)?).map_err(|e| Error::from_io(e, key))
    }

    fn put_content(&self, key: &str, content: &[u8]) -> Result<()> {
        let mut source = content;
        self.write_atomic(key, &mut source)
    }

    fn stream_read(&self, key: &str) -> Result<ByteChunks> {
        let file = fs::File::open(self.path(key)?).map_err(|e| Error::from_io(e, key))?;
        Ok(Box::new(ChunkReader::new(file, key)))
    }

    fn stream_write(&self, key: &str, source: &mut dyn Read) -> Result<()> {
        self.write_atomic(key, source)
    }

    fn list_directory(&self, prefix: &str) -> Result<Keys> {
        let dir = self.path(prefix)?;
        let entries = fs::read_dir(&dir).map_err(|e| Error::from_io(e, prefix))?;
        let prefix = normalize("", prefix).trim_end_matches('/').to_string();
        let key = prefix.clone();
        Ok(Box::new(entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(Error::from_io(e, &key))),
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            // in-flight temp files from write_atomic
            if name.starts_with(".tmp") {
                return None;
            }
            if prefix.is_empty() {
                Some(Ok(name))
            } else {
                Some(Ok(format!("{}/{}", prefix, name)))
            }
        })))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path(key)?.exists())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn get_size(&self, key: &str) -> Result<u64> {
        let metadata = fs::metadata(self.path(key)?).map_err(|e| Error::from_io(e, key))?;
        Ok(metadata.len())
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.path(key).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::collect_chunks;
    use proptest::prelude::*;

    fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("root")).unwrap();
        (dir, storage)
    }

    #[test]
    fn put_then_get() {
        let (_dir, storage) = storage();
        storage.put_content("images/a/json", b"{}").unwrap();
        assert_eq!(storage.get_content("images/a/json").unwrap(), b"{}");
        assert_eq!(storage.get_size("images/a/json").unwrap(), 2);
        assert!(storage.exists("images/a/json").unwrap());

        storage.put_content("images/a/json", b"{\"id\":\"a\"}").unwrap();
        assert_eq!(storage.get_content("images/a/json").unwrap(), b"{\"id\":\"a\"}");
    }

    #[test]
    fn missing_keys() {
        let (_dir, storage) = storage();
        assert!(!storage.exists("images/nope/json").unwrap());
        assert!(storage.get_content("images/nope/json").unwrap_err().is_not_found());
        assert!(storage.get_size("images/nope/json").unwrap_err().is_not_found());
        assert!(storage.stream_read("images/nope/layer").is_err());
        assert!(storage.list_directory("images/nope").is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, storage) = storage();
        storage.put_content("images/a/_inprogress", b"true").unwrap();
        for _ in 0..3 {
            storage.remove("images/a/_inprogress").unwrap();
        }
        assert!(!storage.exists("images/a/_inprogress").unwrap());
        storage.remove("never/written").unwrap();
    }

    #[test]
    fn stream_round_trip() {
        let (_dir, storage) = storage();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        storage.stream_write("images/a/layer", &mut &data[..]).unwrap();
        let read = collect_chunks(storage.stream_read("images/a/layer").unwrap()).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn failed_stream_leaves_nothing() {
        struct Broken(usize);
        impl Read for Broken {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0 == 0 {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "reset"));
                }
                self.0 -= 1;
                buf[0] = 1;
                Ok(1)
            }
        }
        let (_dir, storage) = storage();
        assert!(storage.stream_write("images/a/layer", &mut Broken(10)).is_err());
        assert!(!storage.exists("images/a/layer").unwrap());
        let listed: Vec<String> = storage
            .list_directory("images/a")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn list_one_level() {
        let (_dir, storage) = storage();
        storage.put_content("images/a/json", b"{}").unwrap();
        storage.put_content("images/b/json", b"{}").unwrap();
        let mut listed: Vec<String> = storage
            .list_directory("images")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        listed.sort();
        assert_eq!(listed, vec!["images/a", "images/b"]);
    }

    #[test]
    fn rejects_parent_segments() {
        let (_dir, storage) = storage();
        assert!(storage.put_content("../escape", b"x").is_err());
    }

    proptest! {
        #[test]
        fn round_trip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let (_dir, storage) = storage();
            storage.put_content("images/p/layer", &payload).unwrap();
            prop_assert_eq!(storage.get_content("images/p/layer").unwrap(), payload);
        }
    }
}
