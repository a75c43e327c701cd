use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::storage::s3::Credentials;
use crate::storage::{
    Backend, CachedStorage, ContentCache, LocalStorage, RemoteStorage, S3Client, Storage,
};

pub const USAGE: &str = "
Image layer store.

Usage:
    layerstore [options]
    layerstore (-h | --help)

Options:
    -h --help            Show this screen.
    --bind ADDR          Address to listen on [default: 127.0.0.1:5000]
    --backend KIND       Storage backend, local or s3 [default: local]
    --root ROOT          Directory (local) or key prefix (s3) [default: /tmp/layerstore]
    --bucket BUCKET      Bucket, required for s3
    --endpoint URL       S3 endpoint [default: https://s3.amazonaws.com]
    --region REGION      S3 region [default: us-east-1]
    --chunk-size BYTES   Multipart part size [default: 5242880]
    --cache-dir DIR      Parent directory of the metadata cache, system temp dir if unset
    --cache-size BYTES   Metadata cache capacity, 0 disables it [default: 268435456]
    --pending-ttl SECS   How long layer checksums wait for their claim [default: 3600]
";

#[derive(Deserialize, Debug)]
pub struct Args {
    pub flag_bind: String,
    pub flag_backend: String,
    pub flag_root: String,
    pub flag_bucket: Option<String>,
    pub flag_endpoint: String,
    pub flag_region: String,
    pub flag_chunk_size: usize,
    pub flag_cache_dir: Option<String>,
    pub flag_cache_size: u64,
    pub flag_pending_ttl: u64,
}

#[derive(Debug)]
pub enum BackendConfig {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        endpoint: String,
        region: String,
        /// Key prefix inside the bucket.
        root: String,
        chunk_size: usize,
        credentials: Credentials,
    },
}

#[derive(Debug)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub capacity: u64,
}

#[derive(Debug)]
pub struct Config {
    pub bind: String,
    pub backend: BackendConfig,
    pub cache: Option<CacheConfig>,
    pub pending_ttl: Duration,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Config> {
        Config::resolve(args, Credentials::from_env)
    }

    fn resolve<F>(args: Args, credentials: F) -> Result<Config>
    where
        F: FnOnce() -> Result<Credentials>,
    {
        let backend = match args.flag_backend.as_str() {
            "local" => BackendConfig::Local {
                root: PathBuf::from(&args.flag_root),
            },
            "s3" => {
                let bucket = args
                    .flag_bucket
                    .filter(|bucket| !bucket.is_empty())
                    .ok_or_else(|| Error::Config("--bucket is required for s3".to_string()))?;
                BackendConfig::S3 {
                    bucket,
                    endpoint: args.flag_endpoint,
                    region: args.flag_region,
                    root: args.flag_root,
                    chunk_size: args.flag_chunk_size,
                    credentials: credentials()?,
                }
            }
            other => return Err(Error::Config(format!("unknown backend {:?}", other))),
        };
        let cache = match args.flag_cache_size {
            0 => None,
            capacity => Some(CacheConfig {
                dir: args
                    .flag_cache_dir
                    .filter(|dir| !dir.is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir),
                capacity,
            }),
        };
        Ok(Config {
            bind: args.flag_bind,
            backend,
            cache,
            pending_ttl: Duration::from_secs(args.flag_pending_ttl),
        })
    }

    /// Builds the backend. Must not run inside an async runtime, the s3
    /// client blocks.
    pub fn open_backend(&self) -> Result<Backend> {
        let backend = match &self.backend {
            BackendConfig::Local { root } => Backend::Local(LocalStorage::new(root)?),
            BackendConfig::S3 {
                bucket,
                endpoint,
                region,
                root,
                chunk_size,
                credentials,
            } => {
                let client = S3Client::new(endpoint, region, credentials.clone())?;
                Backend::S3(RemoteStorage::new(client, bucket, root, *chunk_size))
            }
        };
        info!("using {} backend", backend.kind());
        Ok(backend)
    }

    /// The backend, behind the metadata cache when one is configured.
    pub fn open_store(&self) -> Result<Arc<dyn Storage>> {
        let backend = self.open_backend()?;
        match &self.cache {
            None => Ok(Arc::new(backend)),
            Some(cache) => {
                let content = ContentCache::open(&cache.dir, cache.capacity)?;
                Ok(Arc::new(CachedStorage::new(backend, content)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docopt::Docopt;

    fn args(argv: &[&str]) -> Args {
        Docopt::new(USAGE)
            .and_then(|d| {
                d.argv(std::iter::once("layerstore").chain(argv.iter().copied()))
                    .deserialize()
            })
            .unwrap()
    }

    fn credentials() -> Result<Credentials> {
        Ok(Credentials {
            access_key: "AKID".to_string(),
            secret_key: "secret".to_string(),
            session_token: None,
        })
    }

    #[test]
    fn defaults() {
        let config = Config::resolve(args(&[]), credentials).unwrap();
        assert_eq!(config.bind, "127.0.0.1:5000");
        assert!(matches!(
            config.backend,
            BackendConfig::Local { ref root } if root == &PathBuf::from("/tmp/layerstore")
        ));
        let cache = config.cache.unwrap();
        assert_eq!(cache.capacity, 256 * 1024 * 1024);
        assert_eq!(cache.dir, std::env::temp_dir());
        assert_eq!(config.pending_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn s3_backend() {
        let config = Config::resolve(
            args(&[
                "--backend", "s3", "--bucket", "layers", "--root", "/registry/",
                "--chunk-size", "1024", "--cache-size", "0",
            ]),
            credentials,
        )
        .unwrap();
        assert!(config.cache.is_none());
        match config.backend {
            BackendConfig::S3 {
                bucket,
                endpoint,
                region,
                root,
                chunk_size,
                ..
            } => {
                assert_eq!(bucket, "layers");
                assert_eq!(endpoint, "https://s3.amazonaws.com");
                assert_eq!(region, "us-east-1");
                assert_eq!(root, "/registry/");
                assert_eq!(chunk_size, 1024);
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn s3_needs_bucket_and_credentials() {
        let err = Config::resolve(args(&["--backend", "s3"]), credentials).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let missing = || Err(Error::Config("AWS_ACCESS_KEY_ID is not set".to_string()));
        let err = Config::resolve(args(&["--backend", "s3", "--bucket", "b"]), missing).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_backend() {
        let err = Config::resolve(args(&["--backend", "ftp"]), credentials).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn local_store_with_cache() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let config = Config::resolve(
            args(&[
                "--root",
                root.to_str().unwrap(),
                "--cache-dir",
                dir.path().to_str().unwrap(),
                "--cache-size",
                "65536",
            ]),
            credentials,
        )
        .unwrap();
        let store = config.open_store().unwrap();
        store.put_content("images/a/json", b"{}").unwrap();
        assert_eq!(store.get_content("images/a/json").unwrap(), b"{}");
        assert!(root.join("images/a/json").is_file());
    }
}
