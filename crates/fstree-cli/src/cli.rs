use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "fstree",
    version,
    about = "Snapshot, cache, and sync directory trees by content hash"
)]
pub struct FstreeCli {
    /// Cache directory holding objects/ and tmp/.
    #[arg(long, short = 'c', global = true, env = "FSTREE_CACHE")]
    pub cache: Option<PathBuf>,

    /// Upper bound for the object store, e.g. 512MiB or 10GiB.
    #[arg(
        long = "cache-size",
        global = true,
        env = "FSTREE_CACHE_SIZE",
        default_value = "10GiB"
    )]
    pub cache_size: String,

    /// Minimum object age in seconds before eviction may remove it.
    #[arg(
        long = "cache-retention",
        global = true,
        env = "FSTREE_CACHE_RETENTION",
        default_value_t = 3600
    )]
    pub cache_retention: u64,

    /// Workspace-relative ignore file.
    #[arg(
        long,
        short = 'i',
        global = true,
        env = "FSTREE_IGNORE",
        default_value = fstree_core::DEFAULT_IGNORE_FILE
    )]
    pub ignore: PathBuf,

    /// Workspace-relative index file.
    #[arg(
        long = "index",
        short = 'x',
        global = true,
        env = "FSTREE_INDEX",
        default_value = fstree_core::DEFAULT_INDEX_FILE
    )]
    pub index: PathBuf,

    /// Remote object store URL (http://, https://, or file://).
    #[arg(long, short = 'r', global = true, env = "FSTREE_REMOTE")]
    pub remote: Option<String>,

    /// Worker pool size; defaults to the hardware concurrency.
    #[arg(long, short = 'j', global = true, env = "FSTREE_THREADS")]
    pub threads: Option<usize>,

    /// Emit JSON-line events on stderr.
    #[arg(long, short = 'J', global = true)]
    pub json: bool,

    /// Increase diagnostic verbosity (-v, -vv).
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Snapshot a directory into the cache and print its tree hash.
    WriteTree {
        /// Workspace to snapshot; defaults to the current directory.
        directory: Option<PathBuf>,
    },
    /// Snapshot a directory, then push the snapshot to the remote.
    WriteTreePush {
        directory: Option<PathBuf>,
    },
    /// Push a cached tree to the remote.
    Push {
        /// Tree hash, as `<alg>:<hex>` or bare hex.
        tree: String,
    },
    /// Fetch a tree and its objects from the remote into the cache.
    Pull {
        tree: String,
    },
    /// Pull a tree from the remote, then check it out.
    PullCheckout {
        tree: String,
        /// Checkout destination; defaults to the current directory.
        directory: Option<PathBuf>,
    },
    /// Check out a locally cached tree.
    Checkout {
        tree: String,
        directory: Option<PathBuf>,
    },
    /// List the entries of the on-disk index.
    LsIndex {
        directory: Option<PathBuf>,
    },
    /// List the children of a cached tree object.
    LsTree {
        tree: String,
    },
}
