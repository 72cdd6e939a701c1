//! Input source resolution
//!
//! A source spec is a comma-separated list of entries. Each entry is a glob
//! (`*`, `?`, `[`), a directory (files with the adapter's extension), or a
//! file. Relative entries resolve against the input directory. Results are
//! de-duplicated and sorted lexicographically.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::TraktError;

fn is_glob(spec: &str) -> bool {
    spec.contains(['*', '?', '['])
}

fn has_extension(path: &Path, extension: Option<&str>) -> bool {
    match extension {
        None => true,
        Some(ext) => path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_ascii_lowercase()) == ext.to_ascii_lowercase())
            .unwrap_or(false),
    }
}

/// Resolve a source spec to concrete files. Returns an empty list when nothing matches.
pub fn resolve_input_paths(
    spec: &str,
    base_dir: &Path,
    extension: Option<&str>,
) -> Result<Vec<PathBuf>, TraktError> {
    let mut found = BTreeSet::new();

    for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let candidate = if Path::new(entry).is_absolute() {
            PathBuf::from(entry)
        } else {
            base_dir.join(entry)
        };

        if is_glob(entry) {
            let pattern = candidate.to_string_lossy().into_owned();
            let matches = glob::glob(&pattern)
                .map_err(|e| TraktError::adapter(entry, format!("invalid glob pattern: {e}")))?;
            for path in matches {
                let path = path.map_err(|e| TraktError::adapter(entry, e))?;
                if path.is_file() && has_extension(&path, extension) {
                    found.insert(path);
                }
            }
        } else if candidate.is_dir() {
            for dir_entry in std::fs::read_dir(&candidate)? {
                let path = dir_entry?.path();
                if path.is_file() && has_extension(&path, extension) {
                    found.insert(path);
                }
            }
        } else if candidate.is_file() {
            if !has_extension(&candidate, extension) {
                return Err(TraktError::adapter(
                    candidate.display(),
                    format!(
                        "expected a '{}' file",
                        extension.unwrap_or_default()
                    ),
                ));
            }
            found.insert(candidate);
        }
    }

    Ok(found.into_iter().collect())
}

/// Resolve a target path against the output directory
pub fn resolve_output_path(uri: Option<&str>, name: &str, output_dir: &Path, extension: Option<&str>) -> PathBuf {
    match uri.map(str::trim).filter(|u| !u.is_empty()) {
        Some(uri) if Path::new(uri).is_absolute() => PathBuf::from(uri),
        Some(uri) => output_dir.join(uri),
        None => output_dir.join(format!("{name}{}", extension.unwrap_or_default())),
    }
}
