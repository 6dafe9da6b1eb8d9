//! SHA-256 digests of artifact files.

use std::fs::File;
use std::io::{self, BufReader, Read};

use camino::Utf8Path;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the file at `path`.
pub fn sha256_file(path: &Utf8Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
