//! Source scanning and content fingerprints for config sync
//!
//! A single-file source is fingerprinted by its own SHA-256. A directory is
//! fingerprinted by the SHA-256 of its per-file hex digests concatenated in
//! traversal order, which is sorted by path so the result is stable.

use glob::Pattern;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{FleetError, Result};

/// One file picked up by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path local to the source root, `/` separated. Empty for a single-file source.
    pub relative: String,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Everything a sync needs to know about its source
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub root: PathBuf,
    pub is_dir: bool,
    pub files: Vec<SourceFile>,
    /// Entries dropped by exclude patterns
    pub skipped: usize,
    pub total_bytes: u64,
    pub fingerprint: String,
}

impl SourceSnapshot {
    /// Remote path each file lands on, in traversal order
    pub fn remote_paths(&self, target: &str) -> Vec<String> {
        if !self.is_dir {
            return vec![target.to_string()];
        }
        let base = target.trim_end_matches('/');
        self.files
            .iter()
            .map(|f| format!("{}/{}", base, f.relative))
            .collect()
    }
}

pub fn compile_excludes(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| {
                FleetError::Validation(format!("invalid exclude pattern '{}': {}", p, e))
            })
        })
        .collect()
}

fn is_excluded(excludes: &[Pattern], relative: &str, file_name: &str) -> bool {
    excludes
        .iter()
        .any(|p| p.matches(relative) || p.matches(file_name))
}

/// Walk `source` and hash every non-excluded regular file.
pub fn scan_source(source: &Path, excludes: &[Pattern]) -> Result<SourceSnapshot> {
    let meta = fs::metadata(source)
        .map_err(|_| FleetError::not_found("source", source.display().to_string()))?;

    let mut files = Vec::new();
    let mut skipped = 0;
    if meta.is_dir() {
        walk(source, "", excludes, &mut files, &mut skipped)?;
    } else {
        files.push(SourceFile {
            relative: String::new(),
            path: source.to_path_buf(),
            size: meta.len(),
            sha256: sha256_file(source)?,
        });
    }

    let hashes: Vec<&str> = files.iter().map(|f| f.sha256.as_str()).collect();
    Ok(SourceSnapshot {
        root: source.to_path_buf(),
        is_dir: meta.is_dir(),
        total_bytes: files.iter().map(|f| f.size).sum(),
        fingerprint: fingerprint(meta.is_dir(), &hashes),
        files,
        skipped,
    })
}

fn walk(
    dir: &Path,
    prefix: &str,
    excludes: &[Pattern],
    files: &mut Vec<SourceFile>,
    skipped: &mut usize,
) -> Result<()> {
    let mut entries: Vec<(String, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
        .collect();
    entries.sort();

    for (name, path) in entries {
        let relative = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        if is_excluded(excludes, &relative, &name) {
            *skipped += 1;
            continue;
        }

        let meta = fs::metadata(&path)?;
        if meta.is_dir() {
            walk(&path, &relative, excludes, files, skipped)?;
        } else if meta.is_file() {
            files.push(SourceFile {
                sha256: sha256_file(&path)?,
                size: meta.len(),
                relative,
                path,
            });
        }
    }
    Ok(())
}

/// Streaming SHA-256 of a file, lowercase hex
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn combine_hashes<S: AsRef<str>>(hashes: &[S]) -> String {
    let mut hasher = Sha256::new();
    for h in hashes {
        hasher.update(h.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn fingerprint<S: AsRef<str>>(is_dir: bool, hashes: &[S]) -> String {
    match (is_dir, hashes) {
        (false, [single]) => single.as_ref().to_string(),
        _ => combine_hashes(hashes),
    }
}

/// Parse `sha256sum` output lines (`<hash>  <path>` or `<hash> *<path>`).
///
/// A line starting with `\` carries a path with `\\` and `\n` escapes, which
/// GNU coreutils emits for names containing a backslash or newline.
pub fn parse_sha256sum_output(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (escaped, line) = match line.strip_prefix('\\') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let (hash, rest) = line.split_once(char::is_whitespace)?;
            let is_hex = hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit());
            if !is_hex {
                return None;
            }
            let path = rest.trim_start().trim_start_matches('*');
            let path = if escaped { unescape_path(path) } else { path.to_string() };
            Some((hash.to_ascii_lowercase(), path))
        })
        .collect()
}

fn unescape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Recompute the fingerprint from the remote side's `sha256sum` output over
/// `remote_paths`.
pub fn remote_fingerprint(
    snapshot: &SourceSnapshot,
    remote_paths: &[String],
    output: &str,
) -> Result<String> {
    let reported: HashMap<String, String> = parse_sha256sum_output(output)
        .into_iter()
        .map(|(hash, path)| (path, hash))
        .collect();

    let mut hashes = Vec::with_capacity(remote_paths.len());
    for path in remote_paths {
        let hash = reported.get(path).ok_or_else(|| FleetError::ChecksumMismatch {
            expected: snapshot.fingerprint.clone(),
            actual: format!("no checksum reported for {}", path),
        })?;
        hashes.push(hash.as_str());
    }
    Ok(fingerprint(snapshot.is_dir, &hashes))
}
