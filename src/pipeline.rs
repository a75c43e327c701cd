// Passive observers on an inbound byte stream. Every chunk read from the
// source is handed to each handler, in registration order, before the
// consumer sees it. A failing handler fails the read.
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};

pub trait ChunkHandler {
    fn handle(&mut self, chunk: &[u8]) -> std::io::Result<()>;
}

impl<F> ChunkHandler for F
where
    F: FnMut(&[u8]) -> std::io::Result<()>,
{
    fn handle(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self(chunk)
    }
}

/// Reader that forwards everything it reads to its handlers.
pub struct TeeReader<'a, R> {
    source: R,
    handlers: Vec<&'a mut dyn ChunkHandler>,
    bytes: u64,
}

impl<'a, R: Read> TeeReader<'a, R> {
    pub fn new(source: R) -> TeeReader<'a, R> {
        TeeReader {
            source,
            handlers: Vec::new(),
            bytes: 0,
        }
    }

    pub fn add_handler(&mut self, handler: &'a mut dyn ChunkHandler) {
        self.handlers.push(handler);
    }

    /// Bytes read from the source so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }
}

impl<'a, R: Read> Read for TeeReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.source.read(buf)?;
        for handler in self.handlers.iter_mut() {
            handler.handle(&buf[..n])?;
        }
        self.bytes += n as u64;
        Ok(n)
    }
}

/// SHA-256 over the literal bytes, as `sha256:<hex>`.
pub struct DigestHandler {
    digest: Sha256,
    size: u64,
}

impl DigestHandler {
    pub fn new() -> DigestHandler {
        DigestHandler {
            digest: Sha256::new(),
            size: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> String {
        format!("sha256:{:x}", self.digest.finalize())
    }
}

impl Default for DigestHandler {
    fn default() -> Self {
        DigestHandler::new()
    }
}

impl ChunkHandler for DigestHandler {
    fn handle(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.digest.update(chunk);
        self.size += chunk.len() as u64;
        Ok(())
    }
}

/// Copies the stream into an anonymous temp file for a second, seekable pass.
/// The file is unlinked from the start and goes away on drop.
pub struct SpoolHandler {
    file: File,
}

impl SpoolHandler {
    pub fn new() -> std::io::Result<SpoolHandler> {
        Ok(SpoolHandler {
            file: tempfile::tempfile()?,
        })
    }

    /// The spooled copy, rewound.
    pub fn into_file(mut self) -> std::io::Result<File> {
        self.file.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(self.file)
    }
}

impl ChunkHandler for SpoolHandler {
    fn handle(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_see_every_chunk_in_order() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();
        let mut first = Vec::new();
        let mut order = Vec::new();
        let mut copy = |chunk: &[u8]| -> std::io::Result<()> {
            first.extend_from_slice(chunk);
            Ok(())
        };
        let mut calls = 0usize;
        let mut count = |chunk: &[u8]| -> std::io::Result<()> {
            calls += 1;
            order.push(chunk.len());
            Ok(())
        };
        let mut consumed = Vec::new();
        {
            let mut reader = TeeReader::new(&data[..]);
            reader.add_handler(&mut copy);
            reader.add_handler(&mut count);
            reader.read_to_end(&mut consumed).unwrap();
            assert_eq!(reader.bytes_read(), data.len() as u64);
        }
        assert_eq!(consumed, data);
        assert_eq!(first, data);
        assert_eq!(order.iter().sum::<usize>(), data.len());
        assert!(calls > 0);
    }

    #[test]
    fn handler_failure_fails_the_read() {
        let mut refuse = |_: &[u8]| -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        };
        let mut reader = TeeReader::new(&b"abc"[..]);
        reader.add_handler(&mut refuse);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn digest_and_spool_agree_with_source() {
        let mut digest = DigestHandler::new();
        let mut spool = SpoolHandler::new().unwrap();
        {
            let mut reader = TeeReader::new(&b"abc"[..]);
            reader.add_handler(&mut digest);
            reader.add_handler(&mut spool);
            std::io::copy(&mut reader, &mut std::io::sink()).unwrap();
        }
        assert_eq!(digest.size(), 3);
        assert_eq!(
            digest.finish(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let mut spooled = String::new();
        spool.into_file().unwrap().read_to_string(&mut spooled).unwrap();
        assert_eq!(spooled, "abc");
    }
}
