//! Directory tree archive codec
//!
//! Encodes a directory tree into one MessagePack blob and back. Used to ship
//! plugin directories to the remote server and to answer filesystem gateway
//! pulls.
//!
//! Whitelist semantics: entries are paths relative to the root. Parents of a
//! whitelisted path are traversed, but once a directory has whitelisted
//! descendants listed explicitly, only those are taken; the most specific
//! path wins. A name matching any ignore pattern excludes that entry and its
//! entire subtree, whitelisted or not.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Names excluded by default when shipping plugin trees
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &["^\\.git$", "^target$", "^\\.cache$"];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("whitelist path is outside the tree root: {0}")]
    ForeignWhitelistPath(PathBuf),

    #[error("invalid ignore pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("archive encoding failed: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    #[error("archive decoding failed: {0}")]
    Decode(#[source] rmp_serde::decode::Error),

    #[error("archive entry escapes the target directory: {0}")]
    EntryEscapes(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeEntry {
    /// Path relative to the tree root, '/'-separated
    path: String,
    data: Vec<u8>,
}

/// Compile a set of name patterns for use as the `ignore` argument
pub fn compile_patterns(patterns: &[&str]) -> Result<Vec<Regex>, ArchiveError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| ArchiveError::Pattern {
                pattern: (*p).to_string(),
                source,
            })
        })
        .collect()
}

/// Encode the directory at `root` into a byte blob.
///
/// With `whitelist == None` everything under `root` is included. Ignore
/// patterns match individual file or directory names and prune whole
/// subtrees.
pub fn encode_tree(
    root: &Path,
    whitelist: Option<&HashSet<PathBuf>>,
    ignore: Option<&[Regex]>,
) -> Result<Vec<u8>, ArchiveError> {
    if !root.is_dir() {
        return Err(ArchiveError::NotADirectory(root.to_path_buf()));
    }

    let allow = match whitelist {
        Some(paths) => Some(normalize_whitelist(root, paths)?),
        None => None,
    };
    let ignore = ignore.unwrap_or(&[]);

    let mut entries = Vec::new();
    walk(root, Path::new(""), allow.as_ref(), ignore, &mut entries)?;

    rmp_serde::to_vec(&entries).map_err(ArchiveError::Encode)
}

/// Decode a blob produced by [`encode_tree`] into `target`.
///
/// With `clean_first` the target directory is removed before extraction so
/// no artifacts from prior decodes survive.
pub fn decode_tree(bytes: &[u8], target: &Path, clean_first: bool) -> Result<(), ArchiveError> {
    if clean_first && target.is_dir() {
        fs::remove_dir_all(target).map_err(|source| ArchiveError::Write {
            path: target.to_path_buf(),
            source,
        })?;
    }
    fs::create_dir_all(target).map_err(|source| ArchiveError::Write {
        path: target.to_path_buf(),
        source,
    })?;

    let entries: Vec<TreeEntry> = rmp_serde::from_slice(bytes).map_err(ArchiveError::Decode)?;

    for entry in entries {
        let rel = sanitize_entry_path(&entry.path)?;
        let dest = target.join(&rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|source| ArchiveError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&dest, &entry.data).map_err(|source| ArchiveError::Write {
            path: dest.clone(),
            source,
        })?;
    }

    Ok(())
}

/// Make whitelist paths relative to the root and add every ancestor so the
/// walk can reach the listed leaves.
fn normalize_whitelist(
    root: &Path,
    paths: &HashSet<PathBuf>,
) -> Result<HashSet<PathBuf>, ArchiveError> {
    let mut normalized = HashSet::new();

    for path in paths {
        let rel = if path.is_absolute() {
            path.strip_prefix(root)
                .map_err(|_| ArchiveError::ForeignWhitelistPath(path.clone()))?
                .to_path_buf()
        } else {
            // Strip leading "./" components.
            path.components()
                .filter(|c| !matches!(c, Component::CurDir))
                .collect()
        };

        let mut ancestor = rel.parent().map(Path::to_path_buf);
        normalized.insert(rel);
        while let Some(dir) = ancestor {
            if dir.as_os_str().is_empty() {
                break;
            }
            ancestor = dir.parent().map(Path::to_path_buf);
            normalized.insert(dir);
        }
    }

    Ok(normalized)
}

fn walk(
    root: &Path,
    dir_rel: &Path,
    allow: Option<&HashSet<PathBuf>>,
    ignore: &[Regex],
    entries: &mut Vec<TreeEntry>,
) -> Result<(), ArchiveError> {
    let dir_abs = root.join(dir_rel);
    let read_dir = fs::read_dir(&dir_abs).map_err(|source| ArchiveError::Read {
        path: dir_abs.clone(),
        source,
    })?;

    let mut children: Vec<_> = read_dir
        .collect::<Result<_, _>>()
        .map_err(|source| ArchiveError::Read {
            path: dir_abs.clone(),
            source,
        })?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let name = child.file_name();
        let name_str = name.to_string_lossy();
        if ignore.iter().any(|p| p.is_match(&name_str)) {
            continue;
        }

        let rel = dir_rel.join(&name);
        if let Some(allow) = allow {
            if !allow.contains(&rel) {
                continue;
            }
        }

        let abs = child.path();
        let file_type = child.file_type().map_err(|source| ArchiveError::Read {
            path: abs.clone(),
            source,
        })?;

        if file_type.is_dir() {
            // Whitelisted descendants of this directory, if any, narrow the
            // recursion; a directory listed without descendants is taken whole.
            let narrowed: Option<HashSet<PathBuf>> = allow.map(|a| {
                a.iter()
                    .filter(|p| p.starts_with(&rel) && p.as_path() != rel)
                    .cloned()
                    .collect()
            });
            let sub_allow = match narrowed.as_ref() {
                Some(set) if set.is_empty() => None,
                Some(set) => Some(set),
                None => None,
            };
            walk(root, &rel, sub_allow, ignore, entries)?;
        } else if file_type.is_file() {
            let data = fs::read(&abs).map_err(|source| ArchiveError::Read {
                path: abs.clone(),
                source,
            })?;
            entries.push(TreeEntry {
                path: rel_to_archive_path(&rel),
                data,
            });
        }
        // Symlinks and other special entries are skipped.
    }

    Ok(())
}

fn rel_to_archive_path(rel: &Path) -> String {
    rel.iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn sanitize_entry_path(path: &str) -> Result<PathBuf, ArchiveError> {
    let rel = PathBuf::from_iter(path.split('/'));
    let escapes = rel.components().any(|c| {
        !matches!(c, Component::Normal(_))
    });
    if escapes || rel.as_os_str().is_empty() {
        return Err(ArchiveError::EntryEscapes(path.to_string()));
    }
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn decoded_paths(bytes: &[u8], target: &Path) -> HashSet<String> {
        decode_tree(bytes, target, true).unwrap();
        let mut paths = HashSet::new();
        collect(target, target, &mut paths);
        paths
    }

    fn collect(root: &Path, dir: &Path, out: &mut HashSet<String>) {
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            if entry.path().is_dir() {
                collect(root, &entry.path(), out);
            } else {
                out.insert(rel_to_archive_path(
                    entry.path().strip_prefix(root).unwrap(),
                ));
            }
        }
    }

    #[test]
    fn full_tree_round_trip() {
        let src = TempDir::new().unwrap();
        write(src.path(), "top.txt", "top");
        write(src.path(), "a/one.txt", "1");
        write(src.path(), "a/b/two.txt", "2");

        let bytes = encode_tree(src.path(), None, None).unwrap();
        let dst = TempDir::new().unwrap();
        let paths = decoded_paths(&bytes, dst.path());

        assert_eq!(
            paths,
            HashSet::from([
                "top.txt".to_string(),
                "a/one.txt".to_string(),
                "a/b/two.txt".to_string(),
            ])
        );
        assert_eq!(fs::read_to_string(dst.path().join("a/b/two.txt")).unwrap(), "2");
    }

    #[test]
    fn most_specific_whitelist_path_wins() {
        let src = TempDir::new().unwrap();
        write(src.path(), "a/b/kept.txt", "kept");
        write(src.path(), "a/c/dropped.txt", "dropped");
        write(src.path(), "outside.txt", "dropped");

        // "a" is whitelisted, but the more specific "a/b" narrows it: the
        // sibling "a/c" is excluded.
        let whitelist = HashSet::from([PathBuf::from("a"), PathBuf::from("a/b")]);
        let bytes = encode_tree(src.path(), Some(&whitelist), None).unwrap();

        let dst = TempDir::new().unwrap();
        let paths = decoded_paths(&bytes, dst.path());
        assert_eq!(paths, HashSet::from(["a/b/kept.txt".to_string()]));
    }

    #[test]
    fn whitelisted_directory_without_descendants_is_taken_whole() {
        let src = TempDir::new().unwrap();
        write(src.path(), "a/one.txt", "1");
        write(src.path(), "a/deep/two.txt", "2");
        write(src.path(), "other/three.txt", "3");

        let whitelist = HashSet::from([PathBuf::from("a")]);
        let bytes = encode_tree(src.path(), Some(&whitelist), None).unwrap();

        let dst = TempDir::new().unwrap();
        let paths = decoded_paths(&bytes, dst.path());
        assert_eq!(
            paths,
            HashSet::from(["a/one.txt".to_string(), "a/deep/two.txt".to_string()])
        );
    }

    #[test]
    fn ignore_pattern_prunes_whitelisted_subtree() {
        let src = TempDir::new().unwrap();
        write(src.path(), "a/keep.txt", "keep");
        write(src.path(), "a/target/cached.bin", "x");
        write(src.path(), "a/target/nested/more.bin", "y");

        let whitelist = HashSet::from([PathBuf::from("a"), PathBuf::from("a/target")]);
        let ignore = compile_patterns(&["^target$"]).unwrap();
        let bytes = encode_tree(src.path(), Some(&whitelist), Some(&ignore)).unwrap();

        let dst = TempDir::new().unwrap();
        let paths = decoded_paths(&bytes, dst.path());
        assert_eq!(paths, HashSet::from(["a/keep.txt".to_string()]));
    }

    #[test]
    fn clean_first_removes_prior_contents() {
        let src = TempDir::new().unwrap();
        write(src.path(), "fresh.txt", "fresh");
        let bytes = encode_tree(src.path(), None, None).unwrap();

        let dst = TempDir::new().unwrap();
        write(dst.path(), "stale.txt", "stale");

        decode_tree(&bytes, dst.path(), true).unwrap();
        assert!(dst.path().join("fresh.txt").is_file());
        assert!(!dst.path().join("stale.txt").exists());
    }

    #[test]
    fn escaping_entry_paths_are_rejected() {
        let entries = vec![TreeEntry {
            path: "../evil.txt".to_string(),
            data: vec![1],
        }];
        let bytes = rmp_serde::to_vec(&entries).unwrap();

        let dst = TempDir::new().unwrap();
        let result = decode_tree(&bytes, dst.path(), false);
        assert!(matches!(result, Err(ArchiveError::EntryEscapes(_))));
    }

    #[test]
    fn encoding_a_file_fails() {
        let src = TempDir::new().unwrap();
        write(src.path(), "file.txt", "x");
        let result = encode_tree(&src.path().join("file.txt"), None, None);
        assert!(matches!(result, Err(ArchiveError::NotADirectory(_))));
    }
}
