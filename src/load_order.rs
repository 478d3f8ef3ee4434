//! `plugins.txt` maintenance.
//!
//! One plugin per line; a leading `*` marks it enabled and `#` starts a
//! comment. Names compare case-insensitively. Line endings of an existing
//! file are preserved.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::fsutil;

#[derive(Error, Debug)]
#[error("cannot update load order {}: {source}", .path.display())]
pub struct LoadOrderError {
    pub path:   PathBuf,
    pub source: io::Error,
}

fn plugin_name(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(line.trim_start_matches('*'))
}

fn contains(names: &[String], candidate: &str) -> bool {
    names.iter().any(|n| n.eq_ignore_ascii_case(candidate))
}

struct LoadOrder {
    lines:  Vec<String>,
    ending: &'static str,
}

impl LoadOrder {
    /// `Ok(None)` when the file's directory does not exist.
    fn open(path: &Path) -> Result<Option<Self>, LoadOrderError> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        if !parent.map_or(true, Path::is_dir) {
            debug!(path = %path.display(), "load order directory missing, skipping");
            return Ok(None);
        }
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(LoadOrderError { path: path.to_owned(), source }),
        };
        let ending = if text.contains("\r\n") { "\r\n" } else { "\n" };
        Ok(Some(Self { lines: text.lines().map(str::to_owned).collect(), ending }))
    }

    fn save(&self, path: &Path) -> Result<(), LoadOrderError> {
        let mut text = self.lines.join(self.ending);
        if !text.is_empty() {
            text.push_str(self.ending);
        }
        fsutil::write_atomic(path, text.as_bytes()).map_err(|source| LoadOrderError { path: path.to_owned(), source })
    }
}

/// Append each of `names` as an enabled entry unless already listed.
/// Returns the number of entries added.
pub fn register(path: &Path, names: &[String]) -> Result<usize, LoadOrderError> {
    let Some(mut order) = LoadOrder::open(path)? else {
        return Ok(0);
    };
    let mut added = 0;
    for name in names {
        let listed = order
            .lines
            .iter()
            .filter_map(|l| plugin_name(l))
            .any(|p| p.eq_ignore_ascii_case(name));
        if !listed {
            order.lines.push(format!("*{name}"));
            added += 1;
        }
    }
    if added > 0 {
        order.save(path)?;
        info!(path = %path.display(), added, "registered plugins");
    }
    Ok(added)
}

/// Drop every line naming one of `names`. Returns the number removed.
pub fn unregister(path: &Path, names: &[String]) -> Result<usize, LoadOrderError> {
    if !path.is_file() {
        return Ok(0);
    }
    let Some(mut order) = LoadOrder::open(path)? else {
        return Ok(0);
    };
    let before = order.lines.len();
    order
        .lines
        .retain(|l| !plugin_name(l).is_some_and(|p| contains(names, p)));
    let removed = before - order.lines.len();
    if removed > 0 {
        order.save(path)?;
        info!(path = %path.display(), removed, "unregistered plugins");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn register_appends_once_and_keeps_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.txt");
        fs::write(&path, "# header\r\n*Fallout4.esm\r\n*ccmerged.esl\r\n").unwrap();

        let added = register(&path, &names(&["CCMerged.esl", "CCMerged_Textures.esl"])).unwrap();
        assert_eq!(added, 1);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# header\r\n*Fallout4.esm\r\n*ccmerged.esl\r\n*CCMerged_Textures.esl\r\n"
        );
    }

    #[test]
    fn unregister_removes_enabled_and_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.txt");
        fs::write(&path, "*Fallout4.esm\nCCMerged.esl\n*CCMerged_Sounds.esl\n").unwrap();

        let removed = unregister(&path, &names(&["ccmerged.esl", "CCMerged_Sounds.esl"])).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(fs::read_to_string(&path).unwrap(), "*Fallout4.esm\n");
    }

    #[test]
    fn missing_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope/plugins.txt");
        assert_eq!(register(&path, &names(&["CCMerged.esl"])).unwrap(), 0);
        assert!(!path.exists());
        assert_eq!(unregister(&path, &names(&["CCMerged.esl"])).unwrap(), 0);
    }

    #[test]
    fn register_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.txt");
        register(&path, &names(&["CCMerged.esl"])).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "*CCMerged.esl\n");
    }
}
