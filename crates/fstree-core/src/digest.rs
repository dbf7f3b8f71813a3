use std::fmt;

use anyhow::Result;

use crate::errors::Error;

/// Hash algorithms a [`Digest`] can carry. `None` is the empty digest of a
/// dirty inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algorithm {
    #[default]
    None,
    Sha1,
    Blake3,
}

impl Algorithm {
    /// The algorithm this build hashes with. Selected at compile time, like
    /// the on-disk formats it feeds.
    pub fn active() -> Algorithm {
        if cfg!(feature = "hash-sha1") {
            Algorithm::Sha1
        } else {
            Algorithm::Blake3
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::None => "",
            Algorithm::Sha1 => "sha1",
            Algorithm::Blake3 => "blake3",
        }
    }

    /// Length of the hex form: 40 for SHA-1, 64 for BLAKE3.
    pub fn hex_len(self) -> usize {
        match self {
            Algorithm::None => 0,
            Algorithm::Sha1 => 40,
            Algorithm::Blake3 => 64,
        }
    }
}

/// A typed `(algorithm, hex)` pair naming an object in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Digest {
    alg: Algorithm,
    hex: String,
}

impl Digest {
    pub fn none() -> Digest {
        Digest::default()
    }

    pub(crate) fn new(alg: Algorithm, hex: String) -> Digest {
        Digest { alg, hex }
    }

    /// Parse `"<alg>:<hex>"`, or a bare hex string whose length picks the
    /// algorithm (40 hex chars is SHA-1, 64 is BLAKE3). The empty string is
    /// the empty digest.
    pub fn parse(s: &str) -> Result<Digest> {
        if s.is_empty() {
            return Ok(Digest::none());
        }

        let (alg, hex) = match s.split_once(':') {
            None => match s.len() {
                40 => (Algorithm::Sha1, s),
                64 => (Algorithm::Blake3, s),
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "cannot determine algorithm for digest: {s}"
                    ))
                    .into())
                }
            },
            Some(("sha1", hex)) => (Algorithm::Sha1, hex),
            Some(("blake3", hex)) => (Algorithm::Blake3, hex),
            Some((alg, _)) => {
                return Err(Error::InvalidArgument(format!("unknown algorithm: {alg}")).into())
            }
        };

        if hex.len() != alg.hex_len() {
            return Err(Error::InvalidArgument(format!(
                "invalid {} digest length: {hex}",
                alg.name()
            ))
            .into());
        }

        Ok(Digest {
            alg,
            hex: hex.to_string(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.alg
    }

    /// The raw hex, without the algorithm prefix.
    pub fn hexdigest(&self) -> &str {
        &self.hex
    }

    pub fn is_empty(&self) -> bool {
        self.hex.is_empty()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.alg == Algorithm::None {
            return Ok(());
        }
        write!(f, "{}:{}", self.alg.name(), self.hex)
    }
}
