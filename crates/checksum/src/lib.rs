#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Streaming SHA-1 content hashing.
//!
//! The digest is used purely as a change detector for backup verification;
//! no cryptographic strength is claimed or required. Files are read through
//! a bounded buffer so hashing large files does not inflate memory use.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use sha1::{Digest, Sha1};

/// Size of the read buffer used while hashing.
const HASH_BUFFER_LEN: usize = 64 * 1024;

/// Number of hexadecimal characters in a rendered digest.
pub const HASH_HEX_LEN: usize = 40;

/// Computes the SHA-1 digest of the file at `path`, returned as 40 lowercase
/// hexadecimal characters.
///
/// # Errors
///
/// Returns the underlying [`io::Error`] when the file cannot be opened or
/// read; the caller decides whether that aborts the surrounding scan.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_LEN, file);
    let mut hasher = Sha1::new();
    loop {
        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            break;
        }
        hasher.update(chunk);
        let consumed = chunk.len();
        reader.consume(consumed);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Returns true when `hash` is a well-formed rendered digest: exactly 40
/// lowercase hexadecimal characters.
#[must_use]
pub fn is_valid_hex_digest(hash: &str) -> bool {
    hash.len() == HASH_HEX_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
