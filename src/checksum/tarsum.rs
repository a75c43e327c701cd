// Partial implementation of tarsum v1
// https://github.com/moby/moby/blob/master/pkg/tarsum/tarsum_spec.md
// known missing:
// * xattr
// * dealing with duplicated entries
//
// The entry hashes are prefixed with a seed (the image json) before the
// final hash, so the digest covers the metadata as well as the contents.
use std::io::Read;

use sha2::{Digest, Sha256};
use tar::Archive;

use crate::error::{Error, Result};

pub const PREFIX: &str = "tarsum.v1+sha256:";

fn format_error(e: std::io::Error) -> Error {
    Error::ArchiveFormat(e.to_string())
}

// Unset numeric fields (all NUL or blank) read as 0, like go's archive/tar.
fn numeric<T: Default>(field: &[u8], parsed: std::io::Result<T>) -> Result<T> {
    if field.iter().all(|b| *b == 0 || *b == b' ') {
        return Ok(T::default());
    }
    parsed.map_err(format_error)
}

fn canonical_header_representation<R: Read>(entry: &tar::Entry<R>) -> Result<String> {
    let link_name = match entry.link_name_bytes() {
        Some(x) => x.into_owned(),
        None => Vec::new(),
    };
    let link_name_str = String::from_utf8_lossy(&link_name);
    let header = entry.header();
    let raw = header.as_old();

    Ok(format!(
        "name{}mode{}uid{}gid{}size{}typeflag{}linkname{}uname{}gname{}devmajor{}devminor{}",
        header.path().map_err(format_error)?.display(),
        numeric(&raw.mode, header.mode())?,
        numeric(&raw.uid, header.uid())?,
        numeric(&raw.gid, header.gid())?,
        numeric(&raw.size, header.size())?,
        header.entry_type().as_byte() as char,
        link_name_str,
        // uname and gname are left empty, like the go implementation does
        "",
        "",
        match header.device_major() {
            Ok(Some(x)) => x,
            _ => 0,
        },
        match header.device_minor() {
            Ok(Some(x)) => x,
            _ => 0,
        },
    ))
}

/// Archive digest of the tar stream in `reader`, seeded with `seed`.
///
/// An empty stream counts as an empty archive.
pub fn tarsum<R: Read>(reader: R, seed: &[u8]) -> Result<String> {
    let mut archive = Archive::new(reader);
    let mut sums = Vec::new();

    for file in archive.entries().map_err(format_error)? {
        let mut file = file.map_err(format_error)?;

        let mut hasher = Sha256::new();
        hasher.update(canonical_header_representation(&file)?);
        std::io::copy(&mut file, &mut hasher).map_err(format_error)?;
        sums.push(format!("{:x}", hasher.finalize()));
    }
    sums.sort();

    let mut full = Sha256::new();
    full.update(seed);
    full.update(sums.join("").as_bytes());
    Ok(format!("{}{:x}", PREFIX, full.finalize()))
}
