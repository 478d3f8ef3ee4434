//! Loose localization strings.
//!
//! The engine resolves `.strings`/`.dlstrings`/`.ilstrings` files from the
//! loose `Strings/` directory before it looks inside containers, and the
//! original CC plugins still own the string keys. Strings are therefore
//! moved out of every staged tree to `Strings/<base>_<language>.<ext>` and
//! never packed.
//!
//! Every move is recorded in the [`StringsManifest`] at
//! `<content-root>/moved_strings_manifest` *before* the file is touched, so an
//! interrupted run can still be undone. A loose file already present at a
//! destination is parked in the snapshot's `displaced_strings/` directory
//! first and put back by [`undo`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classify::ContentKind;
use crate::fsutil;

pub const MANIFEST_FILE: &str = "moved_strings_manifest";

#[derive(Error, Debug)]
pub enum StringsError {
    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("Manifest {} is corrupt: {source}", .path.display())]
    Manifest { path: PathBuf, source: serde_json::Error },
    #[error("Manifest {} belongs to an earlier run", .0.display())]
    Foreign(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StringsError + '_ {
    move |source| StringsError::Io { path: path.to_owned(), source }
}

// ── Manifest ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringsEntry {
    /// Container the file was extracted from.
    pub container:   String,
    /// Path inside the container, `/` separated.
    pub source:      String,
    pub destination: PathBuf,
    pub base:        String,
    pub language:    Option<String>,
    /// Where a pre-existing loose file at `destination` was parked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displaced:   Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringsManifest {
    pub entries: Vec<StringsEntry>,
}

impl StringsManifest {
    pub fn path(root: &Path) -> PathBuf {
        root.join(MANIFEST_FILE)
    }

    pub fn load(root: &Path) -> Result<Option<Self>, StringsError> {
        let path = Self::path(root);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StringsError::Manifest { path, source })
    }

    pub fn save(&self, root: &Path) -> Result<(), StringsError> {
        let path = Self::path(root);
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|source| StringsError::Manifest { path: path.clone(), source })?;
        fsutil::write_atomic(&path, &bytes).map_err(io_err(&path))
    }
}

/// Split `Name_lang.ext` into (`Name`, `lang`, `ext`).
pub fn split_language(file_name: &str) -> Option<(&str, &str, &str)> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    let (base, language) = stem.rsplit_once('_')?;
    if base.is_empty() || language.is_empty() {
        return None;
    }
    Some((base, language, ext))
}

// ── Extractor ────────────────────────────────────────────────────────────────

pub struct StringsExtractor {
    root:          PathBuf,
    strings_dir:   PathBuf,
    displaced_dir: PathBuf,
    manifest:      StringsManifest,
}

impl StringsExtractor {
    /// Starts an empty manifest. A manifest left by an earlier run must be
    /// [`retire`]d first; it is never extended.
    pub fn new(root: &Path, strings_dir: &str, displaced_dir: PathBuf) -> Result<Self, StringsError> {
        let path = StringsManifest::path(root);
        if path.exists() {
            return Err(StringsError::Foreign(path));
        }
        Ok(Self {
            root: root.to_owned(),
            strings_dir: root.join(strings_dir),
            displaced_dir,
            manifest: StringsManifest::default(),
        })
    }

    pub fn manifest(&self) -> &StringsManifest {
        &self.manifest
    }

    /// Move every localization file below `tree` (the extracted contents of
    /// `container`) to the loose strings directory. Returns the number moved.
    pub fn extract_tree(&mut self, container: &str, tree: &Path) -> Result<usize, StringsError> {
        let files = fsutil::list_files(tree).map_err(io_err(tree))?;
        let mut moved = 0;
        for file in files {
            if ContentKind::from_path(&file) != ContentKind::Localization {
                continue;
            }
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (base, language) = match split_language(&file_name) {
                Some((base, lang, _)) => (base.to_owned(), Some(lang.to_owned())),
                None => {
                    warn!(file = %file_name, "strings file has no language suffix");
                    let base = file_name.rsplit_once('.').map(|(b, _)| b).unwrap_or(&file_name);
                    (base.to_owned(), None)
                }
            };

            let destination = self.strings_dir.join(&file_name);
            let ours = self.manifest.entries.iter().any(|e| e.destination == destination);
            let displaced = (!ours && destination.is_file())
                .then(|| self.displaced_dir.join(&file_name));

            let source = file
                .strip_prefix(tree)
                .unwrap_or(&file)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            // Write-ahead: the entry is durable before anything moves.
            self.manifest.entries.push(StringsEntry {
                container: container.to_owned(),
                source,
                destination: destination.clone(),
                base,
                language,
                displaced: displaced.clone(),
            });
            self.manifest.save(&self.root)?;

            if let Some(parked) = &displaced {
                debug!(file = %file_name, "parking existing loose strings file");
                fsutil::move_file(&destination, parked).map_err(io_err(&destination))?;
            }
            fsutil::move_file(&file, &destination).map_err(io_err(&file))?;
            moved += 1;
        }
        if moved > 0 {
            info!(container, moved, "moved strings to loose files");
        }
        Ok(moved)
    }
}

/// Reverse every move recorded in the manifest under `root`, then delete the
/// manifest. Returns the number of loose files removed.
pub fn undo(root: &Path) -> Result<usize, StringsError> {
    let Some(manifest) = StringsManifest::load(root)? else {
        return Ok(0);
    };
    let mut removed = 0;
    for entry in manifest.entries.iter().rev() {
        match &entry.displaced {
            // The user's file sits at the destination until it has been
            // parked, so only replace it once the parked copy exists.
            Some(parked) => {
                if parked.is_file() {
                    fsutil::move_file(parked, &entry.destination).map_err(io_err(parked))?;
                    removed += 1;
                }
            }
            None => {
                if fsutil::remove_if_exists(&entry.destination).map_err(io_err(&entry.destination))? {
                    removed += 1;
                }
            }
        }
    }
    let path = StringsManifest::path(root);
    fsutil::remove_if_exists(&path).map_err(io_err(&path))?;
    Ok(removed)
}

/// Move the manifest under `root` into `dir`, so its moves are kept when a
/// later run is undone. Returns whether a manifest was present.
pub fn retire(root: &Path, dir: &Path) -> Result<bool, StringsError> {
    let path = StringsManifest::path(root);
    if !path.is_file() {
        return Ok(false);
    }
    fsutil::move_file(&path, &dir.join(MANIFEST_FILE)).map_err(io_err(&path))?;
    info!(into = %dir.display(), "retired strings manifest");
    Ok(true)
}
