//! Cleanup pattern matching
//!
//! Patterns starting with `/` are anchored at the root of the cleaned tree
//! and match the whole relative path. Other patterns match the final path
//! component anywhere in the tree. `*` matches any run of characters except
//! `/`; `?` matches exactly one such character.

use crate::error::{BuildError, BuildResult};
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Whether `pattern` matches the relative path `rel` (forward slashes)
pub fn pattern_matches(pattern: &str, rel: &str) -> bool {
    match pattern.strip_prefix('/') {
        Some(anchored) => path_match(anchored.trim_end_matches('/'), rel),
        None => {
            let name = rel.rsplit('/').next().unwrap_or(rel);
            path_match(pattern, name)
        }
    }
}

/// Wildcards never cross `/`, so paths match segment by segment
fn path_match(pattern: &str, text: &str) -> bool {
    let mut patterns = pattern.split('/');
    let mut segments = text.split('/');
    loop {
        match (patterns.next(), segments.next()) {
            (None, None) => return true,
            (Some(p), Some(t)) if segment_match(p, t) => continue,
            _ => return false,
        }
    }
}

/// Linear wildcard match of one path segment, per character
fn segment_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    // Position after the last `*` and the text position it is matched up to
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p + 1, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((after, matched)) => {
                    p = after;
                    t = matched + 1;
                    star = Some((after, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// Relative paths under `root` matched by any pattern, leaf-first
pub fn matching_paths(root: &Path, patterns: &[String]) -> BuildResult<Vec<String>> {
    if patterns.is_empty() || !root.exists() {
        return Ok(Vec::new());
    }

    let mut matches = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let context = format!("walking {}", root.display());
            BuildError::io(context, io::Error::other(e.to_string()))
        })?;
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(rel) = rel.to_str() else {
            continue;
        };
        let rel = rel.replace(std::path::MAIN_SEPARATOR, "/");
        if patterns.iter().any(|p| pattern_matches(p, &rel)) {
            matches.push(rel);
        }
    }

    // Reverse lexical order puts children before their parent directory
    matches.sort();
    matches.reverse();
    Ok(matches)
}

/// Remove everything under `root` matched by `patterns`; returns removed paths
pub fn remove_matching(root: &Path, patterns: &[String]) -> BuildResult<Vec<String>> {
    let paths = matching_paths(root, patterns)?;
    let mut removed = Vec::with_capacity(paths.len());

    for rel in paths {
        let full = root.join(&rel);
        let meta = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(BuildError::io(format!("inspecting {}", full.display()), e)),
        };

        let result = if meta.is_dir() {
            fs::remove_dir_all(&full)
        } else {
            fs::remove_file(&full)
        };
        result.map_err(|e| BuildError::io(format!("removing {}", full.display()), e))?;
        debug!("Removed {}", rel);
        removed.push(rel);
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn patterns(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn anchored_patterns_match_whole_path() {
        assert!(pattern_matches("/include", "include"));
        assert!(pattern_matches("/include/", "include"));
        assert!(pattern_matches("/lib/*.la", "lib/libz.la"));
        assert!(!pattern_matches("/lib/*.la", "lib/sub/libz.la"));
        assert!(!pattern_matches("/include", "share/include"));
    }

    #[test]
    fn bare_patterns_match_basename_anywhere() {
        assert!(pattern_matches("*.a", "lib/libz.a"));
        assert!(pattern_matches("*.a", "libz.a"));
        assert!(pattern_matches("man", "share/man"));
        assert!(!pattern_matches("*.a", "lib/libz.so"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        assert!(pattern_matches("lib?.so", "libz.so"));
        assert!(!pattern_matches("lib?.so", "libzz.so"));
        assert!(!pattern_matches("/a?b", "a/b"));
    }

    #[test]
    fn question_mark_matches_a_whole_character() {
        assert!(pattern_matches("caf?", "café"));
        assert!(pattern_matches("/docs/r?sum?.txt", "docs/résumé.txt"));
        assert!(!pattern_matches("caf?", "caf"));
    }

    #[test]
    fn star_matches_within_a_segment() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("lib*.so*", "libz.so.1"));
        assert!(pattern_matches("/share/*/README", "share/doc/README"));
        assert!(!pattern_matches("/share/*", "share/doc/README"));
        assert!(!pattern_matches("/*", "a/b"));
        assert!(pattern_matches("a*b*c", "aXbYbZc"));
        assert!(!pattern_matches("a*b*c", "aXbYbZ"));
    }

    #[test]
    fn many_stars_do_not_backtrack_exponentially() {
        let name = "a".repeat(200);
        let pattern = format!("{}b", "*a".repeat(20));
        assert!(!pattern_matches(&pattern, &name));
        assert!(pattern_matches(&format!("{}*", "*a".repeat(20)), &name));
    }

    #[test]
    fn matches_are_leaf_first() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("share/doc/pkg")).unwrap();
        std::fs::write(root.join("share/doc/pkg/README"), "").unwrap();

        let found = matching_paths(root, &patterns(&["/share/doc", "/share/doc/pkg"])).unwrap();
        assert_eq!(found, vec!["share/doc/pkg", "share/doc"]);
    }

    #[test]
    fn remove_matching_deletes_files_and_dirs() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("include")).unwrap();
        std::fs::create_dir_all(root.join("lib")).unwrap();
        std::fs::write(root.join("include/z.h"), "").unwrap();
        std::fs::write(root.join("lib/libz.a"), "").unwrap();
        std::fs::write(root.join("lib/libz.so"), "").unwrap();

        let removed = remove_matching(root, &patterns(&["/include", "*.a"])).unwrap();
        assert_eq!(removed, vec!["lib/libz.a", "include"]);
        assert!(!root.join("include").exists());
        assert!(!root.join("lib/libz.a").exists());
        assert!(root.join("lib/libz.so").exists());
    }

    #[test]
    fn no_patterns_or_missing_root_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(matching_paths(temp.path(), &[]).unwrap().is_empty());
        assert!(matching_paths(&temp.path().join("nope"), &patterns(&["*"]))
            .unwrap()
            .is_empty());
    }
}
