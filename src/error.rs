use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The key has no object behind it.
    #[error("not found: {0}")]
    NotFound(String),

    /// The payload could not be parsed as a tar archive.
    #[error("archive format error: {0}")]
    ArchiveFormat(String),

    #[error("checksum mismatch for image {image_id}: {claimed}")]
    ChecksumMismatch { image_id: String, claimed: String },

    /// A multipart sequence failed before finalize; nothing is visible under `key`.
    #[error("transfer of {key} aborted: {reason}")]
    TransferAborted { key: String, reason: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("image {0} already exists")]
    AlreadyExists(String),

    #[error("image {0} is being uploaded, retry later")]
    UploadInProgress(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl Error {
    /// Maps an io error from the local medium, keeping missing keys distinguishable.
    pub fn from_io(err: std::io::Error, key: &str) -> Error {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(key.to_string())
        } else {
            Error::Io(err)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> std::io::Error {
        match err {
            Error::Io(err) => err,
            Error::NotFound(key) => std::io::Error::new(std::io::ErrorKind::NotFound, key),
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
