//! The remote contract the push/pull pipelines assume, and the transports
//! that implement it. Transports are selected by URL scheme; anything beyond
//! these five capabilities is transport-private.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::digest::Digest;
use crate::errors::Error;

mod fs;
mod http;

pub use self::fs::FsRemote;
pub use self::http::HttpRemote;

/// A remote object store. File and tree objects share one digest namespace.
pub trait Remote: Send + Sync {
    /// Whether the object is present remotely.
    fn has_object(&self, hash: &Digest) -> Result<bool>;

    /// Batched presence probe; the result aligns with the input order.
    fn has_objects(&self, hashes: &[Digest]) -> Result<Vec<bool>>;

    /// For a tree present on the remote, the trees and objects underneath it
    /// that the remote is missing. Remotes without this capability return the
    /// unsupported-operation error, which callers treat as a fallback signal.
    fn has_tree(&self, hash: &Digest) -> Result<(Vec<Digest>, Vec<Digest>)>;

    /// Upload a local object file. Idempotent: an object already present on
    /// the remote is silently tolerated.
    fn write_object(&self, hash: &Digest, path: &Path) -> Result<()>;

    /// Download an object, streaming into a unique temp file under `tmp_dir`
    /// and renaming to `path` on success. Absence is a hard failure.
    fn read_object(&self, hash: &Digest, path: &Path, tmp_dir: &Path) -> Result<()>;
}

impl std::fmt::Debug for dyn Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Remote")
    }
}

/// Create a transport for a remote URL. `http://` and `https://` speak to a
/// blob store over HTTP; `file://` uses a local directory.
pub fn from_url(url: &str) -> Result<Arc<dyn Remote>> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(Error::InvalidArgument(format!("invalid remote url: {url}")).into());
    };
    match scheme {
        "http" | "https" => Ok(Arc::new(HttpRemote::new(url)?)),
        "file" => Ok(Arc::new(FsRemote::new(Path::new(rest)))),
        _ => Err(Error::InvalidArgument(format!("unknown remote scheme: {scheme}")).into()),
    }
}
