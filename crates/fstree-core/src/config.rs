use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::errors::Error;

/// Upper bound on total object-store size: 10 GiB.
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Minimum object age before eviction may remove it.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// Workspace-relative ignore file.
pub const DEFAULT_IGNORE_FILE: &str = ".fstreeignore";

/// Workspace-relative index file. The containing `.fstree` directory is
/// invisible to the walker.
pub const DEFAULT_INDEX_FILE: &str = ".fstree/index";

/// Per-user cache root, `~/.cache/fstree`.
pub fn default_cache_dir() -> Result<PathBuf> {
    let home = dirs_next::home_dir().context("failed to resolve HOME for cache directory")?;
    Ok(home.join(".cache").join("fstree"))
}

/// Parse a size string with optional `K/M/G/T` (decimal) or `Ki/Mi/Gi/Ti`
/// (binary) suffix and optional trailing `B`. Whitespace between number and
/// unit is allowed.
pub fn parse_size(input: &str) -> Result<u64> {
    let mut s: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err(Error::InvalidArgument(format!("invalid size: {input}")).into());
    }
    if s.ends_with('B') {
        s.pop();
    }

    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(Error::InvalidArgument(format!("invalid size: {input}")).into());
    }
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid size: {input}")))?;
    let unit = &s[digits.len()..];

    let factor: u64 = match unit {
        "" => 1,
        "K" => 1000,
        "M" => 1000 * 1000,
        "G" => 1000 * 1000 * 1000,
        "T" => 1000 * 1000 * 1000 * 1000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        _ => return Err(Error::InvalidArgument(format!("invalid size unit: {unit}")).into()),
    };

    number
        .checked_mul(factor)
        .ok_or_else(|| Error::InvalidArgument(format!("size overflows: {input}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_and_binary_suffixes() {
        assert_eq!(parse_size("1").unwrap(), 1);
        assert_eq!(parse_size("1K").unwrap(), 1000);
        assert_eq!(parse_size("1M").unwrap(), 1000 * 1000);
        assert_eq!(parse_size("1G").unwrap(), 1000 * 1000 * 1000);
        assert_eq!(parse_size("1T").unwrap(), 1_000_000_000_000);
        assert_eq!(parse_size("1Ki").unwrap(), 1024);
        assert_eq!(parse_size("1Mi").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("1Ti").unwrap(), 1 << 40);
    }

    #[test]
    fn trailing_b_is_optional() {
        assert_eq!(parse_size("1B").unwrap(), 1);
        assert_eq!(parse_size("1KB").unwrap(), 1000);
        assert_eq!(parse_size("1KiB").unwrap(), 1024);
        assert_eq!(parse_size("10GiB").unwrap(), DEFAULT_MAX_SIZE);
    }

    #[test]
    fn whitespace_between_number_and_unit() {
        assert_eq!(parse_size("8 MiB").unwrap(), 8 * 1024 * 1024);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("x").is_err());
        assert!(parse_size("1X").is_err());
        assert!(parse_size("9999999999999999999T").is_err());
    }
}
