use std::io::{self, Read};

use anyhow::Result;

use crate::digest::Digest;
use crate::errors::Error;
use crate::inode::Inode;
use crate::status::FileStatus;

pub(crate) const TREE_MAGIC: u16 = 0x3eee;
pub(crate) const TREE_VERSION: u16 = 1;

/// One child record decoded from a tree object.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub name: String,
    pub hash: Digest,
    pub status: FileStatus,
    pub target: String,
}

/// Serialize a directory's children into a tree object payload. `children`
/// must already be sorted by name; ignored entries are skipped so they never
/// contribute to the tree hash.
pub(crate) fn encode(children: &[&Inode]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&TREE_MAGIC.to_le_bytes());
    out.extend_from_slice(&TREE_VERSION.to_le_bytes());

    for child in children {
        if child.is_ignored() {
            continue;
        }
        let name = child.name().as_bytes();
        out.extend_from_slice(&(name.len() as u64).to_le_bytes());
        out.extend_from_slice(name);

        let hash = child.hash().to_string();
        out.extend_from_slice(&(hash.len() as u64).to_le_bytes());
        out.extend_from_slice(hash.as_bytes());

        out.extend_from_slice(&child.status().bits().to_le_bytes());

        if child.is_symlink() {
            let target = child.target().as_bytes();
            out.extend_from_slice(&(target.len() as u64).to_le_bytes());
            out.extend_from_slice(target);
        }
    }

    out
}

/// Decode a tree object. There is no trailing terminator; a clean EOF between
/// records ends the tree, anything else is a format error.
pub(crate) fn decode<R: Read>(mut reader: R, context: &str) -> Result<Vec<TreeEntry>> {
    let magic = read_u16(&mut reader, context)?;
    if magic != TREE_MAGIC {
        return Err(Error::Format(format!("{context}: invalid magic")).into());
    }
    let version = read_u16(&mut reader, context)?;
    if version != TREE_VERSION {
        return Err(Error::Format(format!("{context}: unsupported version {version}")).into());
    }

    let mut entries = Vec::new();
    loop {
        let name = match try_read_string(&mut reader, context)? {
            Some(name) => name,
            None => break,
        };
        let hash_str = read_string(&mut reader, context)?;
        let hash = Digest::parse(&hash_str)
            .map_err(|err| Error::Format(format!("{context}: {err}")))?;
        let status = FileStatus::from_bits(read_u32(&mut reader, context)?);
        let target = if status.is_symlink() {
            read_string(&mut reader, context)?
        } else {
            String::new()
        };
        entries.push(TreeEntry {
            name,
            hash,
            status,
            target,
        });
    }

    Ok(entries)
}

pub(crate) fn read_u16<R: Read>(reader: &mut R, context: &str) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(reader, &mut buf, context)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_u32<R: Read>(reader: &mut R, context: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf, context)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(reader: &mut R, context: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf, context)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_i64<R: Read>(reader: &mut R, context: &str) -> Result<i64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf, context)?;
    Ok(i64::from_le_bytes(buf))
}

/// Read a length-prefixed string.
pub(crate) fn read_string<R: Read>(reader: &mut R, context: &str) -> Result<String> {
    let len = read_u64(reader, context)?;
    read_string_body(reader, len, context)
}

/// Read a length-prefixed string, or `None` on a clean EOF at the length
/// field (the record boundary where a tree or index may validly end).
pub(crate) fn try_read_string<R: Read>(reader: &mut R, context: &str) -> Result<Option<String>> {
    let mut buf = [0u8; 8];
    match reader.read(&mut buf)? {
        0 => return Ok(None),
        8 => {}
        n => {
            read_exact(reader, &mut buf[n..], context)?;
        }
    }
    let len = u64::from_le_bytes(buf);
    Ok(Some(read_string_body(reader, len, context)?))
}

fn read_string_body<R: Read>(reader: &mut R, len: u64, context: &str) -> Result<String> {
    if len > u32::MAX as u64 {
        return Err(Error::Format(format!("{context}: unreasonable string length {len}")).into());
    }
    let mut buf = vec![0u8; len as usize];
    read_exact(reader, &mut buf, context)?;
    String::from_utf8(buf).map_err(|_| Error::Format(format!("{context}: non-utf8 string")).into())
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], context: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            anyhow::Error::from(Error::Format(format!("{context}: truncated")))
        } else {
            anyhow::Error::from(err)
        }
    })
}
