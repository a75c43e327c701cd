// Chunked transfer for object stores with a per-object size ceiling.
//
// A session is initiated for (bucket, key), the source is cut into
// fixed-size parts numbered 1..=N in stream order, and the object appears
// only when the backend accepts the finalize call with the part manifest.
// A failure before that leaves the session dangling and nothing under key.
use std::io::Read;

use log::{debug, info, warn};

use crate::error::{Error, Result};

/// A part the backend has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// The slice of an object store client the protocol needs.
pub trait MultipartClient: Send + Sync {
    /// Smallest part the backend accepts, apart from the last one.
    fn min_part_size(&self) -> usize {
        1
    }

    fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    /// Returns the opaque upload id.
    fn initiate(&self, bucket: &str, key: &str) -> Result<String>;

    /// Returns the part's etag.
    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String>;

    fn list_parts(&self, bucket: &str, key: &str, upload_id: &str) -> Result<Vec<CompletedPart>>;

    fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;
}

/// One in-flight transfer. Owned by the caller of `upload`.
#[derive(Debug)]
pub struct UploadSession {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub parts: Vec<CompletedPart>,
}

impl UploadSession {
    fn next_part_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }

    fn aborted(&self, reason: String) -> Error {
        warn!(
            "abandoning multipart upload {} for {}/{} after {} parts: {}",
            self.upload_id,
            self.bucket,
            self.key,
            self.parts.len(),
            reason
        );
        Error::TransferAborted {
            key: self.key.clone(),
            reason,
        }
    }
}

/// Fills `buf` from `source`, short only at end of stream.
pub fn read_chunk(source: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Streams `source` to `bucket/key`, returning the number of parts submitted.
///
/// An empty source is written with a single plain put, no session is opened.
pub fn upload<C: MultipartClient + ?Sized>(
    client: &C,
    bucket: &str,
    key: &str,
    source: &mut dyn Read,
    chunk_size: usize,
) -> Result<u32> {
    let chunk_size = chunk_size.max(1);
    let mut buf = vec![0u8; chunk_size];

    let first = read_chunk(source, &mut buf).map_err(|e| Error::TransferAborted {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if first == 0 {
        debug!("empty source for {}/{}, plain put", bucket, key);
        client.put_object(bucket, key, Vec::new())?;
        return Ok(0);
    }

    let upload_id = client.initiate(bucket, key)?;
    info!("started multipart upload {} for {}/{}", upload_id, bucket, key);
    let mut session = UploadSession {
        upload_id,
        bucket: bucket.to_string(),
        key: key.to_string(),
        parts: Vec::new(),
    };

    let mut filled = first;
    while filled > 0 {
        let part_number = session.next_part_number();
        let etag = client
            .upload_part(bucket, key, &session.upload_id, part_number, buf[..filled].to_vec())
            .map_err(|e| session.aborted(format!("part {}: {}", part_number, e)))?;
        debug!(
            "uploaded part {} ({} bytes) of {}",
            part_number, filled, session.upload_id
        );
        session.parts.push(CompletedPart { part_number, etag });

        if filled < chunk_size {
            break;
        }
        filled = read_chunk(source, &mut buf).map_err(|e| session.aborted(e.to_string()))?;
    }

    finalize(client, &session)?;
    info!(
        "completed multipart upload {} for {}/{} with {} parts",
        session.upload_id,
        bucket,
        key,
        session.parts.len()
    );
    Ok(session.parts.len() as u32)
}

// The manifest comes from the backend's own listing and has to agree with
// what was submitted, part for part.
fn finalize<C: MultipartClient + ?Sized>(client: &C, session: &UploadSession) -> Result<()> {
    let mut listed = client
        .list_parts(&session.bucket, &session.key, &session.upload_id)
        .map_err(|e| session.aborted(format!("listing parts: {}", e)))?;
    listed.sort_by_key(|part| part.part_number);

    let listed_numbers: Vec<u32> = listed.iter().map(|part| part.part_number).collect();
    let submitted_numbers: Vec<u32> = session.parts.iter().map(|part| part.part_number).collect();
    if listed_numbers != submitted_numbers {
        return Err(session.aborted(format!(
            "backend lists parts {:?}, submitted {:?}",
            listed_numbers, submitted_numbers
        )));
    }

    client
        .complete(&session.bucket, &session.key, &session.upload_id, &listed)
        .map_err(|e| session.aborted(format!("finalize: {}", e)))
}
