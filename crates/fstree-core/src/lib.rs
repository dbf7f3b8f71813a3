//! Content-addressed filesystem tree snapshotting, caching, and sync.
//!
//! A directory is captured as a sorted [`Index`] of inodes. [`Cache::add`]
//! ingests the index into a sharded object store, producing a tree hash that
//! identifies the snapshot. [`Cache::push`] and [`Cache::pull`] exchange file
//! and tree objects with a [`remote::Remote`], and [`Index::checkout`]
//! reconciles a destination directory against the index with minimal
//! filesystem changes.

mod cache;
mod config;
mod digest;
mod errors;
mod events;
mod glob;
mod hashing;
mod index;
mod inode;
mod lockfile;
pub mod pool;
pub mod remote;
mod status;
mod tree;
pub mod walk;

pub use cache::Cache;
pub use config::{
    default_cache_dir, parse_size, DEFAULT_IGNORE_FILE, DEFAULT_INDEX_FILE, DEFAULT_MAX_SIZE,
    DEFAULT_RETENTION,
};
pub use digest::{Algorithm, Digest};
pub use errors::Error;
pub use events::{event, event_message, event_value, events_enabled, set_events_enabled};
pub use glob::GlobList;
pub use hashing::{hash_bytes, hash_bytes_with, hash_file};
pub use index::Index;
pub use inode::Inode;
pub use status::{FileStatus, FileType};
pub use tree::TreeEntry;
