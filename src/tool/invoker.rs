use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{ArchiveTool, CancelToken, InvocationError, PackRequest};
use crate::classify::Category;
use crate::config::{CategorySettings, Compression};
use crate::fsutil;
use crate::planner::ArchiveGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Unverified,
    Pass,
    Fail,
}

/// A merged container produced by the archive tool.
#[derive(Debug, Clone)]
pub struct OutputContainer {
    pub name:        String,
    pub path:        PathBuf,
    pub category:    Category,
    pub compression: Compression,
    pub size:        u64,
    pub group:       ArchiveGroup,
    pub status:      VerifyStatus,
    /// Additional files the tool wrote next to `path` when splitting by
    /// `max_part_mb`. The engine does not load these.
    pub extra_parts: Vec<PathBuf>,
}

/// Build the container for `group` in `dest_dir`.
///
/// The group's staged units are first gathered under `group_root`, which is
/// then handed to the tool as both source and path root. On failure any
/// partially written container, and any part file the tool added, is
/// removed.
pub fn invoke(
    tool: &dyn ArchiveTool,
    group: &ArchiveGroup,
    settings: &CategorySettings,
    group_root: &Path,
    dest_dir: &Path,
    cancel: &CancelToken,
) -> Result<OutputContainer, InvocationError> {
    assemble(group, group_root)?;

    let name = group.container_name();
    let destination = dest_dir.join(&name);
    let request = PackRequest {
        source:      group_root.to_owned(),
        destination: destination.clone(),
        format:      settings.format,
        compression: settings.compression,
        max_part_mb: settings.max_part_mb,
    };

    let existing = parts(dest_dir, &group.stem)?;
    info!(container = %name, units = group.files.len(), bytes = group.size, "packing");
    let packed = tool.pack(&request, cancel);
    let extra_parts: Vec<PathBuf> = parts(dest_dir, &group.stem)?
        .into_iter()
        .filter(|p| *p != destination && !existing.contains(p))
        .collect();

    if let Err(e) = packed {
        for part in extra_parts.iter().chain([&destination]) {
            if fsutil::remove_if_exists(part)? {
                debug!(file = %part.display(), "removed partial output");
            }
        }
        return Err(e);
    }
    if !extra_parts.is_empty() {
        warn!(container = %name, parts = extra_parts.len(), "tool split the container; extra parts are not loaded by the game");
    }

    let size = match fs::metadata(&destination) {
        Ok(meta) => meta.len(),
        Err(_) => {
            return Err(InvocationError::MissingOutput {
                operation: format!("pack {name}"),
                path: destination,
            })
        }
    };

    Ok(OutputContainer {
        name,
        path: destination,
        category: group.category,
        compression: settings.compression,
        size,
        group: group.clone(),
        status: VerifyStatus::Unverified,
        extra_parts,
    })
}

/// Files in `dir` whose names start with `stem`, compared case-insensitively.
fn parts(dir: &Path, stem: &str) -> io::Result<BTreeSet<PathBuf>> {
    let stem = stem.to_ascii_lowercase();
    let mut found = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && entry.file_name().to_string_lossy().to_ascii_lowercase().starts_with(&stem) {
            found.insert(entry.path());
        }
    }
    Ok(found)
}

/// Move every member unit's files into `group_root`, keeping relative paths.
fn assemble(group: &ArchiveGroup, group_root: &Path) -> Result<(), InvocationError> {
    fs::create_dir_all(group_root)?;
    for unit in &group.files {
        for file in fsutil::list_files(&unit.path)? {
            let rel = file.strip_prefix(&unit.path).unwrap_or(&file);
            let dest = group_root.join(rel);
            if dest.exists() {
                debug!(path = %rel.display(), container = %unit.container, "later source overrides earlier file");
            }
            fsutil::move_file(&file, &dest)?;
        }
    }
    Ok(())
}
