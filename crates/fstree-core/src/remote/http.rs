use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;

use crate::digest::Digest;
use crate::errors::Error;
use crate::remote::Remote;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("fstree/", env!("CARGO_PKG_VERSION"));

/// Blob store over HTTP: objects are addressed as `<base>/<hh>/<rest>`,
/// probed with HEAD, uploaded with PUT, and fetched with GET. `has_tree` is
/// unsupported; pushes fall back to per-object probing.
pub struct HttpRemote {
    base: String,
    client: Client,
}

impl HttpRemote {
    pub fn new(base: &str) -> Result<HttpRemote> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build http client")?;
        Ok(HttpRemote {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn object_url(&self, hash: &Digest) -> String {
        let hex = hash.hexdigest();
        if hex.len() <= 2 {
            return format!("{}/{hex}", self.base);
        }
        format!("{}/{}/{}", self.base, &hex[..2], &hex[2..])
    }
}

impl Remote for HttpRemote {
    fn has_object(&self, hash: &Digest) -> Result<bool> {
        let response = match self.client.head(self.object_url(hash)).send() {
            Ok(response) => response,
            Err(_) => return Ok(false),
        };
        Ok(response.status().is_success())
    }

    fn has_objects(&self, hashes: &[Digest]) -> Result<Vec<bool>> {
        hashes.iter().map(|hash| self.has_object(hash)).collect()
    }

    fn has_tree(&self, _hash: &Digest) -> Result<(Vec<Digest>, Vec<Digest>)> {
        Err(Error::Unsupported("has_tree on http remote".to_string()).into())
    }

    fn write_object(&self, hash: &Digest, path: &Path) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("failed to open cache object {}", path.display()))?;
        let response = self
            .client
            .put(self.object_url(hash))
            .body(file)
            .send()
            .with_context(|| format!("failed to upload object {hash}"))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
            status => Err(Error::Remote {
                status: status.as_u16(),
                message: format!("failed to upload object {hash}"),
            }
            .into()),
        }
    }

    fn read_object(&self, hash: &Digest, path: &Path, tmp_dir: &Path) -> Result<()> {
        let mut response = self
            .client
            .get(self.object_url(hash))
            .send()
            .with_context(|| format!("failed to download object {hash}"))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(Error::NotFound(format!("object {hash} on remote")).into());
            }
            status => {
                return Err(Error::Remote {
                    status: status.as_u16(),
                    message: format!("failed to download object {hash}"),
                }
                .into());
            }
        }

        let mut tmp = tempfile::NamedTempFile::new_in(tmp_dir)
            .context("failed to create temporary file")?;
        io::copy(&mut response, &mut tmp)
            .with_context(|| format!("failed to write object {hash} to temporary file"))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        tmp.persist(path)
            .with_context(|| format!("failed to rename temporary file to {}", path.display()))?;
        Ok(())
    }
}
