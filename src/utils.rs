//! Utility functions for file-spec matching and local file management

use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Maximum number of rename attempts when resolving archive collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Compile comma-split wildcard patterns into case-insensitive matchers.
///
/// Only `*` (any run) and `?` (any single character) are special; every other
/// character is matched literally.
pub fn compile_file_specs(specs: &[String]) -> Result<Vec<Regex>> {
    specs
        .iter()
        .map(|spec| {
            let mut pattern = String::with_capacity(spec.len() + 8);
            pattern.push_str("(?i)^");
            for ch in spec.chars() {
                match ch {
                    '*' => pattern.push_str(".*"),
                    '?' => pattern.push('.'),
                    other => pattern.push_str(&regex::escape(&other.to_string())),
                }
            }
            pattern.push('$');
            Regex::new(&pattern)
                .map_err(|e| Error::config("fileExtensions", format!("bad pattern {spec:?}: {e}")))
        })
        .collect()
}

/// Whether `name` matches any of the compiled file specs.
pub fn matches_any(specs: &[Regex], name: &str) -> bool {
    specs.iter().any(|re| re.is_match(name))
}

/// Move an existing local file into its directory's `Archive/` sub-folder.
///
/// Collisions are resolved by appending ` (1)`, ` (2)`, ... before the
/// extension. Returns the path the file was moved to.
pub fn archive_existing_file(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Other(format!("{} has no parent directory", path.display())))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::Other(format!("{} has no file name", path.display())))?;

    let archive_dir = parent.join("Archive");
    std::fs::create_dir_all(&archive_dir)?;

    let destination = unique_destination(&archive_dir.join(name))?;
    std::fs::rename(path, &destination)?;
    Ok(destination)
}

/// Find a non-existing variant of `path`, appending ` (n)` before the extension.
fn unique_destination(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Other(format!("cannot extract file stem of {}", path.display())))?;
    let extension = path.extension().and_then(|e| e.to_str());
    let parent = path
        .parent()
        .ok_or_else(|| Error::Other(format!("{} has no parent directory", path.display())))?;

    for i in 1..=MAX_RENAME_ATTEMPTS {
        let candidate = match extension {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };
        let candidate = parent.join(candidate);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(Error::Other(format!(
        "could not find a unique archive name for {}",
        path.display()
    )))
}

/// Delete regular files under `dir` whose modification time is more than
/// `max_age_days` whole days before `now`. Returns the number removed.
///
/// Sub-directories are left alone; the purge only thins the top level of a
/// task's destination tree.
pub fn purge_files_older_than(dir: &Path, max_age_days: i64, now: DateTime<Utc>) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
        if (now - modified).num_days() > max_age_days {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
