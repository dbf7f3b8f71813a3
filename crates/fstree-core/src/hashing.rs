use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha1::Digest as _;

use crate::digest::{Algorithm, Digest};

const READ_BUF: usize = 64 * 1024;

enum Hasher {
    Sha1(sha1::Sha1),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(alg: Algorithm) -> Hasher {
        match alg {
            Algorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            _ => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(bytes),
            Hasher::Blake3(h) => {
                h.update(bytes);
            }
        }
    }

    fn finalize(self) -> Digest {
        match self {
            Hasher::Sha1(h) => Digest::new(Algorithm::Sha1, hex::encode(h.finalize())),
            Hasher::Blake3(h) => Digest::new(Algorithm::Blake3, h.finalize().to_hex().to_string()),
        }
    }
}

/// Hash a file's contents with the active algorithm, streaming in 64 KiB
/// chunks.
pub fn hash_file(path: &Path) -> Result<Digest> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let mut hasher = Hasher::new(Algorithm::active());
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize())
}

/// Hash an in-memory payload with the active algorithm.
pub fn hash_bytes(bytes: &[u8]) -> Digest {
    hash_bytes_with(Algorithm::active(), bytes)
}

/// Hash an in-memory payload with an explicit algorithm.
pub fn hash_bytes_with(alg: Algorithm, bytes: &[u8]) -> Digest {
    let mut hasher = Hasher::new(alg);
    hasher.update(bytes);
    hasher.finalize()
}
