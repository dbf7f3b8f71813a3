use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

use crate::errors::Error;

/// A gitignore-style pattern list compiled to a single alternation regex over
/// slash-separated relative paths.
///
/// `*` matches within one path segment, `**` across segments, `?` any single
/// character. A pattern starting with `/` is anchored at the root; any other
/// pattern matches at any depth. A matching directory pattern also matches
/// everything below it. Negated patterns (`!...`) are not supported and are
/// rejected when added.
#[derive(Debug, Clone, Default)]
pub struct GlobList {
    inclusive: Vec<String>,
    exclusive: Vec<String>,
    inclusive_re: Option<Regex>,
    exclusive_re: Option<Regex>,
}

impl GlobList {
    pub fn new() -> GlobList {
        GlobList::default()
    }

    /// Build a compiled list from patterns.
    pub fn from_patterns<I, S>(patterns: I) -> Result<GlobList>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = GlobList::new();
        for pattern in patterns {
            list.add(pattern.as_ref())?;
        }
        list.compile()?;
        Ok(list)
    }

    /// Load patterns from an ignore file, skipping blank lines and `#`
    /// comments, then compile.
    pub fn load(path: &Path) -> Result<GlobList> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to open {} for reading", path.display()))?;
        let mut list = GlobList::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            list.add(line)?;
        }
        list.compile()?;
        Ok(list)
    }

    /// Add one pattern. Trailing slashes are stripped; an empty pattern is a
    /// no-op. Negations are rejected as unsupported.
    pub fn add(&mut self, pattern: &str) -> Result<()> {
        let pattern = pattern.trim_end_matches('/');
        if pattern.is_empty() {
            return Ok(());
        }
        if let Some(_negated) = pattern.strip_prefix('!') {
            return Err(Error::Unsupported("negated patterns".to_string()).into());
        }
        self.inclusive.push(pattern.to_string());
        Ok(())
    }

    /// Compile the accumulated patterns. Must be called after the last `add`
    /// and before `matches`.
    pub fn compile(&mut self) -> Result<()> {
        self.inclusive_re = compile_alternation(&self.inclusive)?;
        self.exclusive_re = compile_alternation(&self.exclusive)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.inclusive.is_empty() && self.exclusive.is_empty()
    }

    /// True if `path` is matched (i.e. should be ignored): no exclusive
    /// pattern matches and an inclusive pattern does.
    pub fn matches(&self, path: &str) -> bool {
        let path = normalized(path);
        if let Some(re) = &self.exclusive_re {
            if re.is_match(&path) {
                return false;
            }
        }
        match &self.inclusive_re {
            Some(re) => re.is_match(&path),
            None => false,
        }
    }
}

#[cfg(windows)]
fn normalized(path: &str) -> std::borrow::Cow<'_, str> {
    std::borrow::Cow::Owned(path.replace('\\', "/"))
}

#[cfg(not(windows))]
fn normalized(path: &str) -> std::borrow::Cow<'_, str> {
    std::borrow::Cow::Borrowed(path)
}

fn compile_alternation(patterns: &[String]) -> Result<Option<Regex>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let bodies: Vec<String> = patterns.iter().map(|p| translate(p)).collect();
    let source = format!("^(?:{})$", bodies.join("|"));
    let re = Regex::new(&source)
        .map_err(|err| Error::InvalidArgument(format!("bad ignore pattern: {err}")))?;
    Ok(Some(re))
}

/// Translate one glob into a regex body. A matched directory implies its
/// whole subtree, hence the `(/.*)?` suffix.
fn translate(pattern: &str) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars().peekable();

    if let Some('/') = chars.peek() {
        chars.next();
    } else {
        out.push_str("(.*/)?");
    }

    let mut star = false;
    while let Some(c) = chars.next() {
        if star {
            star = false;
            if c == '*' {
                // `**` spans segments and swallows the slash that follows it.
                out.push_str(".*");
                if chars.peek() == Some(&'/') {
                    chars.next();
                }
                continue;
            }
            out.push_str("[^/]*");
        }
        match c {
            '*' => star = true,
            '?' => out.push('.'),
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    if star {
        out.push_str("[^/]*");
    }

    out.push_str("(/.*)?");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(patterns: &[&str]) -> GlobList {
        GlobList::from_patterns(patterns.iter().copied()).unwrap()
    }

    #[test]
    fn simple_extension_globs() {
        let ignore = list(&["*.cpp", "*.h"]);
        assert!(ignore.matches("src/main.cpp"));
        assert!(ignore.matches("src/main.h"));
        assert!(!ignore.matches("src/main.o"));
    }

    #[test]
    fn bare_name_matches_subtree() {
        let ignore = list(&[".git"]);
        assert!(ignore.matches(".git"));
        assert!(ignore.matches(".git/objects"));
        assert!(ignore.matches("vendor/.git/config"));
        assert!(!ignore.matches(".gitignore"));
    }

    #[test]
    fn directory_rule_hides_contents() {
        let ignore = list(&["build"]);
        assert!(ignore.matches("build"));
        assert!(ignore.matches("build/out.o"));
        assert!(!ignore.matches("src/main.cpp"));
    }

    #[test]
    fn double_star_spans_segments() {
        let ignore = list(&["src/**"]);
        assert!(ignore.matches("src/main.cpp"));
        assert!(ignore.matches("src/a/b/c"));

        let ignore = list(&["src/**/main.*"]);
        assert!(ignore.matches("src/main.cpp"));
        assert!(ignore.matches("src/deep/nested/main.h"));
        assert!(!ignore.matches("src/deep/other.h"));
    }

    #[test]
    fn anchored_pattern_only_matches_at_root() {
        let ignore = list(&["/build"]);
        assert!(ignore.matches("build"));
        assert!(ignore.matches("build/x"));
        assert!(!ignore.matches("src/build"));
    }

    #[test]
    fn question_mark_matches_one_character() {
        let ignore = list(&["a?c"]);
        assert!(ignore.matches("abc"));
        assert!(!ignore.matches("abbc"));

        let ignore = list(&["src/main.?pp"]);
        assert!(ignore.matches("src/main.cpp"));
        assert!(ignore.matches("src/main.hpp"));
        assert!(!ignore.matches("src/main.h"));
    }

    #[test]
    fn repeated_star_runs_collapse() {
        for pattern in ["src/**/main*", "src/**/main**", "src/**/main***"] {
            let ignore = list(&[pattern]);
            assert!(ignore.matches("src/main.cpp"), "{pattern}");
            assert!(ignore.matches("src/deep/main.h"), "{pattern}");
        }
    }

    #[test]
    fn trailing_slash_is_stripped() {
        let ignore = list(&["build/"]);
        assert!(ignore.matches("build/out.o"));
    }

    #[test]
    fn negation_is_unsupported() {
        let mut ignore = GlobList::new();
        let err = ignore.add("!keep.me").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Unsupported(_))
        ));
    }

    #[test]
    fn empty_list_matches_nothing() {
        let ignore = GlobList::new();
        assert!(!ignore.matches("anything"));
        assert!(!ignore.matches(""));
    }

    #[test]
    fn load_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".fstreeignore");
        fs::write(&path, "# objects\n\n*.o\nbuild/\n").unwrap();
        let ignore = GlobList::load(&path).unwrap();
        assert!(ignore.matches("src/main.o"));
        assert!(ignore.matches("build/dep"));
        assert!(!ignore.matches("# objects"));
    }
}
