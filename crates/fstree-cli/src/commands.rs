use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use fstree_core::remote::{self, Remote};
use fstree_core::{
    default_cache_dir, event_message, events_enabled, parse_size, Cache, Digest, Error, GlobList,
    Index, Inode,
};

use crate::cli::{Command, FstreeCli};

pub struct CommandContext {
    cache: Cache,
    ignore_file: PathBuf,
    index_file: PathBuf,
    remote_url: Option<String>,
}

impl CommandContext {
    pub fn new(cli: &FstreeCli) -> Result<CommandContext> {
        let cache_dir = match &cli.cache {
            Some(dir) => absolutize(dir)?,
            None => default_cache_dir()?,
        };
        let max_size = parse_size(&cli.cache_size)?;
        let retention = Duration::from_secs(cli.cache_retention);
        let cache = Cache::new(&cache_dir, max_size, retention)?;

        Ok(CommandContext {
            cache,
            ignore_file: cli.ignore.clone(),
            index_file: cli.index.clone(),
            remote_url: cli.remote.clone(),
        })
    }

    fn remote(&self) -> Result<Arc<dyn Remote>> {
        let url = self.remote_url.as_deref().ok_or_else(|| {
            Error::InvalidArgument("missing remote url (--remote or FSTREE_REMOTE)".to_string())
        })?;
        remote::from_url(url)
    }
}

pub fn dispatch(cli: &FstreeCli) -> Result<()> {
    let ctx = CommandContext::new(cli)?;
    match &cli.command {
        Command::WriteTree { directory } => write_tree(&ctx, directory.as_deref(), false),
        Command::WriteTreePush { directory } => write_tree(&ctx, directory.as_deref(), true),
        Command::Push { tree } => push(&ctx, tree),
        Command::Pull { tree } => pull(&ctx, tree),
        Command::Checkout { tree, directory } => checkout(&ctx, tree, directory.as_deref(), false),
        Command::PullCheckout { tree, directory } => {
            checkout(&ctx, tree, directory.as_deref(), true)
        }
        Command::LsIndex { directory } => ls_index(&ctx, directory.as_deref()),
        Command::LsTree { tree } => ls_tree(&ctx, tree),
    }
}

fn write_tree(ctx: &CommandContext, directory: Option<&Path>, push: bool) -> Result<()> {
    let workspace = workspace_dir(directory)?;
    let remote = if push { Some(ctx.remote()?) } else { None };

    let mut ignores = GlobList::new();
    if let Ok(loaded) = GlobList::load(&workspace.join(&ctx.ignore_file)) {
        ignores = loaded;
    }

    let mut index = Index::with_ignores(&workspace, ignores);
    load_index_tolerant(&mut index, &ctx.index_file);

    index.refresh()?;
    ctx.cache.add(&mut index)?;
    if let Some(remote) = &remote {
        ctx.cache.push(&index, remote)?;
    }
    ctx.cache.evict()?;
    index.save(&ctx.index_file)?;

    println!("{}", index.root().hash());
    Ok(())
}

fn push(ctx: &CommandContext, tree: &str) -> Result<()> {
    let tree = parse_tree(tree)?;
    let remote = ctx.remote()?;

    let mut index = Index::new(&workspace_dir(None)?);
    ctx.cache.index_from_tree(&tree, &mut index)?;
    ctx.cache.push(&index, &remote)?;

    println!("{}", index.root().hash());
    Ok(())
}

fn pull(ctx: &CommandContext, tree: &str) -> Result<()> {
    let tree = parse_tree(tree)?;
    let remote = ctx.remote()?;

    let mut index = Index::new(&workspace_dir(None)?);
    ctx.cache.pull(&mut index, &remote, &tree)?;
    ctx.cache.evict()?;

    println!("{}", index.root().hash());
    Ok(())
}

fn checkout(
    ctx: &CommandContext,
    tree: &str,
    directory: Option<&Path>,
    from_remote: bool,
) -> Result<()> {
    let tree = parse_tree(tree)?;
    let workspace = workspace_dir(directory)?;
    let remote = if from_remote { Some(ctx.remote()?) } else { None };

    let mut local = Index::new(&workspace);
    load_index_tolerant(&mut local, &ctx.index_file);

    let mut index = Index::new(&workspace);
    if let Some(remote) = &remote {
        ctx.cache.pull(&mut index, remote, &tree)?;
        ctx.cache.evict()?;
    } else {
        ctx.cache.index_from_tree(&tree, &mut index)?;
    }
    index.sort();
    index.copy_metadata(&local);
    index.load_ignore_from_index(&ctx.cache, &ctx.ignore_file)?;
    index.checkout(&ctx.cache, &workspace)?;
    index.save(&ctx.index_file)?;

    println!("{}", index.root().hash());
    Ok(())
}

fn ls_index(ctx: &CommandContext, directory: Option<&Path>) -> Result<()> {
    let workspace = workspace_dir(directory)?;
    let mut index = Index::new(&workspace);
    index.load(&ctx.index_file)?;

    for node in index.iter() {
        println!("{}", render_entry(node));
    }
    Ok(())
}

fn ls_tree(ctx: &CommandContext, tree: &str) -> Result<()> {
    let tree = parse_tree(tree)?;
    for entry in ctx.cache.read_tree(&tree)? {
        let suffix = if entry.status.is_symlink() {
            format!(" -> {}", entry.target)
        } else {
            String::new()
        };
        println!(
            "{:>40} {} {}{}",
            entry.hash.to_string(),
            entry.status.render(),
            entry.name,
            suffix
        );
    }
    Ok(())
}

fn render_entry(node: &Inode) -> String {
    let suffix = if node.is_symlink() {
        format!(" -> {}", node.target())
    } else {
        String::new()
    };
    format!(
        "{:>40} {} {} {}{}",
        node.hash().to_string(),
        node.status().render(),
        rfc3339(node.mtime()),
        node.path(),
        suffix
    )
}

fn rfc3339(mtime_ns: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(mtime_ns as i128)
        .ok()
        .and_then(|stamp| stamp.format(&Rfc3339).ok())
        .unwrap_or_else(|| "-".to_string())
}

fn parse_tree(tree: &str) -> Result<Digest> {
    let digest = Digest::parse(tree)?;
    if digest.is_empty() {
        return Err(Error::InvalidArgument("missing tree argument".to_string()).into());
    }
    Ok(digest)
}

fn workspace_dir(directory: Option<&Path>) -> Result<PathBuf> {
    match directory {
        Some(dir) => absolutize(dir),
        None => env::current_dir().context("failed to resolve current directory"),
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()
            .context("failed to resolve current directory")?
            .join(path))
    }
}

// A stale or missing index only costs hash reuse; every command that loads
// one proceeds from scratch on failure.
fn load_index_tolerant(index: &mut Index, index_file: &Path) {
    if let Err(err) = index.load(index_file) {
        let message = format!("failed to load index: {err:#}").to_lowercase();
        if events_enabled() {
            event_message("warning", &index_file.display().to_string(), &message);
        } else {
            eprintln!("warning: {message}");
        }
    }
}
