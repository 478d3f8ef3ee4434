//! Source discovery and content classification.
//!
//! Classification happens twice. [`scan_sources`] decides which containers in
//! the content directory take part in a merge and assigns each one a
//! container-level [`Category`]. After the containers are unpacked,
//! [`route_entries`] sorts every extracted file by [`ContentKind`] into the
//! per-category staging trees that the planner works on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::container::{self, ArchiveType, CONTAINER_EXTENSION};
use crate::fsutil;
use crate::plugin::PLUGIN_EXTENSION;

pub const AUDIO_EXTENSIONS:   [&str; 4] = ["xwm", "wav", "fuz", "lip"];
pub const STRINGS_EXTENSIONS: [&str; 3] = ["strings", "dlstrings", "ilstrings"];
const MESH_SCRIPT_EXTENSIONS: [&str; 8] = ["nif", "pex", "psc", "hkx", "bgsm", "bgem", "tri", "swf"];
const TEXTURE_EXTENSIONS:     [&str; 1] = ["dds"];
/// Plugin files share the source prefix but are never merged.
const PLUGIN_EXTENSIONS:      [&str; 3] = [PLUGIN_EXTENSION, "esm", "esp"];

// ── Category ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    General,
    Textures,
    Audio,
    /// Localization text; moved to loose files, never packed.
    Strings,
}

impl Category {
    /// Categories that end up in merged containers, in build order.
    pub const PACKED: [Category; 3] = [Category::General, Category::Textures, Category::Audio];

    pub fn name(self) -> &'static str {
        match self {
            Category::General  => "General",
            Category::Textures => "Textures",
            Category::Audio    => "Sounds",
            Category::Strings  => "Strings",
        }
    }

    /// Inserted between the merged name and the part suffix.
    pub fn stem_infix(self) -> &'static str {
        match self {
            Category::General  => "",
            Category::Textures => "_Textures",
            Category::Audio    => "_Sounds",
            Category::Strings  => "_Strings",
        }
    }

    /// Suffix the engine expects after ` - ` in a container file name.
    pub fn container_suffix(self) -> &'static str {
        match self {
            Category::Textures => "Textures",
            _                  => "Main",
        }
    }

    /// Whether forms registered from this category may own localized text.
    pub fn is_localizable(self) -> bool {
        matches!(self, Category::General)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── ContentKind ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContentKind {
    MeshOrScript,
    Texture,
    Audio,
    Localization,
    Other,
}

impl ContentKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        Self::from_extension(&ext)
    }

    /// Classify by a (possibly backslash separated) entry name.
    pub fn from_entry_name(name: &str) -> Self {
        let file = name.rsplit(['\\', '/']).next().unwrap_or(name);
        let ext = file.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()).unwrap_or_default();
        Self::from_extension(&ext)
    }

    fn from_extension(ext: &str) -> Self {
        if AUDIO_EXTENSIONS.contains(&ext) {
            ContentKind::Audio
        } else if STRINGS_EXTENSIONS.contains(&ext) {
            ContentKind::Localization
        } else if TEXTURE_EXTENSIONS.contains(&ext) {
            ContentKind::Texture
        } else if MESH_SCRIPT_EXTENSIONS.contains(&ext) {
            ContentKind::MeshOrScript
        } else {
            ContentKind::Other
        }
    }
}

// ── SourceContainer ──────────────────────────────────────────────────────────

/// A container selected for merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContainer {
    pub path:     PathBuf,
    /// File name, e.g. `ccBGSFO4001-PipBoy(Black) - Main.ba2`.
    pub name:     String,
    pub size:     u64,
    pub category: Category,
    /// Entry names from the name table; empty when it could not be read.
    pub entries:  Vec<String>,
}

impl SourceContainer {
    /// File name without the container extension.
    pub fn stem(&self) -> &str {
        self.name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.name)
    }

    pub fn localization_entries(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .map(String::as_str)
            .filter(|e| ContentKind::from_entry_name(e) == ContentKind::Localization)
    }
}

/// Result of scanning the content directory.
#[derive(Debug, Default)]
pub struct Scan {
    /// Sorted by lower-cased name.
    pub sources:        Vec<SourceContainer>,
    /// Files that matched the prefix but were not usable containers.
    pub skipped:        Vec<(PathBuf, String)>,
    /// Files carrying the merged-output name.
    pub merged_outputs: Vec<PathBuf>,
}

/// Find the source containers under `root`.
pub fn scan_sources(root: &Path, prefix: &str, merged_name: &str) -> io::Result<Scan> {
    let prefix = prefix.to_ascii_lowercase();
    let merged = merged_name.to_ascii_lowercase();
    let mut scan = Scan::default();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let lower = name.to_ascii_lowercase();
        let path = entry.path();

        if lower.starts_with(&merged) {
            scan.merged_outputs.push(path);
            continue;
        }
        if !lower.starts_with(&prefix) {
            continue;
        }
        let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        if PLUGIN_EXTENSIONS.contains(&ext) {
            continue;
        }
        if ext != CONTAINER_EXTENSION {
            warn!(file = %name, "skipping unrecognized source file");
            scan.skipped.push((path, "not a container".into()));
            continue;
        }

        match classify_container(&path, name.clone()) {
            Ok(source) => {
                debug!(file = %name, category = %source.category, size = source.size, "classified");
                scan.sources.push(source);
            }
            Err(e) => {
                warn!(file = %name, error = %e, "skipping unreadable container");
                scan.skipped.push((path, e.to_string()));
            }
        }
    }

    scan.sources.sort_by(|a, b| {
        a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()).then_with(|| a.name.cmp(&b.name))
    });
    scan.merged_outputs.sort();
    Ok(scan)
}

fn classify_container(path: &Path, name: String) -> Result<SourceContainer, container::ContainerError> {
    let header = container::read_header(path)?;
    let size = fs::metadata(path)?.len();
    let entries = match container::read_entry_names(path) {
        Ok(names) => names,
        Err(e) => {
            debug!(file = %name, error = %e, "name table unreadable, classifying by name only");
            Vec::new()
        }
    };

    let textured = name.to_ascii_lowercase().contains("texture")
        || header.archive_type() == Some(ArchiveType::Textures);
    let category = if textured {
        Category::Textures
    } else if is_audio_only(&entries) {
        Category::Audio
    } else {
        Category::General
    };

    Ok(SourceContainer { path: path.to_owned(), name, size, category, entries })
}

fn is_audio_only(entries: &[String]) -> bool {
    let mut packed = entries
        .iter()
        .map(|e| ContentKind::from_entry_name(e))
        .filter(|k| *k != ContentKind::Localization)
        .peekable();
    packed.peek().is_some() && packed.all(|k| k == ContentKind::Audio)
}

// ── SourceFile ───────────────────────────────────────────────────────────────

/// One source container's contribution to one category, staged on disk.
///
/// This is the atomic unit the planner packs: it is never divided between
/// two groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Staged directory holding the extracted files, mirroring the data tree.
    pub path:      PathBuf,
    /// Name of the container the files came from.
    pub container: String,
    pub category:  Category,
    pub size:      u64,
    pub kind:      ContentKind,
}

/// Directory that holds `category`'s staged units.
pub fn category_dir(staging: &Path, category: Category) -> PathBuf {
    staging.join(category.name())
}

/// Move every file extracted from `source` (under `extracted`) into the
/// staging tree of the category it belongs to.
///
/// Texture containers keep all their files together. For other containers
/// audio entries go to [`Category::Audio`] and everything else to
/// [`Category::General`]. Localization files must already have been moved
/// out; any that remain are left behind with a warning.
pub fn route_entries(
    extracted: &Path,
    source: &SourceContainer,
    staging: &Path,
) -> io::Result<Vec<SourceFile>> {
    // category → (bytes, bytes per kind)
    let mut units: BTreeMap<Category, (u64, BTreeMap<ContentKind, u64>)> = BTreeMap::new();

    for file in fsutil::list_files(extracted)? {
        let kind = ContentKind::from_path(&file);
        let category = match (source.category, kind) {
            (_, ContentKind::Localization) => {
                warn!(file = %file.display(), "localization file left in staging");
                continue;
            }
            (Category::Textures, _) => Category::Textures,
            (_, ContentKind::Audio) => Category::Audio,
            _                       => Category::General,
        };
        let rel = file.strip_prefix(extracted).unwrap_or(&file);
        let dest = category_dir(staging, category).join(source.stem()).join(rel);
        let size = fs::metadata(&file)?.len();
        fsutil::move_file(&file, &dest)?;

        let unit = units.entry(category).or_default();
        unit.0 += size;
        *unit.1.entry(kind).or_insert(0) += size;
    }

    Ok(units
        .into_iter()
        .map(|(category, (size, kinds))| {
            let kind = kinds
                .into_iter()
                .max_by_key(|(_, bytes)| *bytes)
                .map(|(k, _)| k)
                .unwrap_or(ContentKind::Other);
            SourceFile {
                path: category_dir(staging, category).join(source.stem()),
                container: source.name.clone(),
                category,
                size,
                kind,
            }
        })
        .collect())
}

/// Bucket staged units by category.
pub fn by_category(files: Vec<SourceFile>) -> BTreeMap<Category, Vec<SourceFile>> {
    let mut map: BTreeMap<Category, Vec<SourceFile>> = BTreeMap::new();
    for file in files {
        map.entry(file.category).or_default().push(file);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::write_container;
    use std::fs::File;

    fn container(dir: &Path, name: &str, kind: ArchiveType, entries: &[&str]) {
        let names: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
        write_container(File::create(dir.join(name)).unwrap(), 1, kind, &names).unwrap();
    }

    #[test]
    fn content_kind_by_extension() {
        assert_eq!(ContentKind::from_entry_name("Sound\\Voice\\a.FUZ"), ContentKind::Audio);
        assert_eq!(ContentKind::from_entry_name("Strings/cc_en.DLSTRINGS"), ContentKind::Localization);
        assert_eq!(ContentKind::from_entry_name("meshes\\x.nif"), ContentKind::MeshOrScript);
        assert_eq!(ContentKind::from_entry_name("textures\\x.dds"), ContentKind::Texture);
        assert_eq!(ContentKind::from_entry_name("readme"), ContentKind::Other);
    }

    #[test]
    fn scan_assigns_categories_and_skips_noise() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        container(root, "ccAAA - Main.ba2", ArchiveType::General, &["meshes\\a.nif", "sound\\a.wav"]);
        container(root, "ccAAA - Textures.ba2", ArchiveType::Textures, &["textures\\a.dds"]);
        container(root, "ccBBB - Main.ba2", ArchiveType::General, &["sound\\b.xwm", "strings\\ccBBB_en.strings"]);
        container(root, "ccCCC - Main.ba2", ArchiveType::Textures, &["textures\\c.dds"]);
        container(root, "CCMerged - Main.ba2", ArchiveType::General, &[]);
        fs::write(root.join("ccAAA.esl"), b"TES4").unwrap();
        fs::write(root.join("ccBroken - Main.ba2"), b"nope").unwrap();
        fs::write(root.join("ccNotes.txt"), b"hello").unwrap();
        fs::write(root.join("Fallout4 - Main.ba2"), b"ignored").unwrap();

        let scan = scan_sources(root, "cc", "CCMerged").unwrap();
        let cats: Vec<(&str, Category)> = scan.sources.iter().map(|s| (s.name.as_str(), s.category)).collect();
        assert_eq!(cats, vec![
            ("ccAAA - Main.ba2", Category::General),
            ("ccAAA - Textures.ba2", Category::Textures),
            ("ccBBB - Main.ba2", Category::Audio),
            ("ccCCC - Main.ba2", Category::Textures),
        ]);
        assert_eq!(scan.skipped.len(), 2);
        assert_eq!(scan.merged_outputs, vec![root.join("CCMerged - Main.ba2")]);
        assert_eq!(scan.sources[2].localization_entries().count(), 1);
    }

    #[test]
    fn route_splits_audio_and_keeps_textures_whole() {
        let dir = tempfile::tempdir().unwrap();
        let extracted = dir.path().join("x");
        let staging = dir.path().join("staging");
        fs::create_dir_all(extracted.join("meshes")).unwrap();
        fs::create_dir_all(extracted.join("sound")).unwrap();
        fs::write(extracted.join("meshes/a.nif"), vec![0u8; 10]).unwrap();
        fs::write(extracted.join("sound/a.wav"), vec![0u8; 4]).unwrap();

        let source = SourceContainer {
            path: dir.path().join("ccX - Main.ba2"),
            name: "ccX - Main.ba2".into(),
            size: 0,
            category: Category::General,
            entries: Vec::new(),
        };
        let units = route_entries(&extracted, &source, &staging).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!((units[0].category, units[0].size, units[0].kind), (Category::General, 10, ContentKind::MeshOrScript));
        assert_eq!((units[1].category, units[1].size, units[1].kind), (Category::Audio, 4, ContentKind::Audio));
        assert!(staging.join("Sounds/ccX - Main/sound/a.wav").is_file());

        fs::create_dir_all(extracted.join("sound")).unwrap();
        fs::write(extracted.join("sound/b.wav"), vec![0u8; 3]).unwrap();
        let textures = SourceContainer { category: Category::Textures, name: "ccX - Textures.ba2".into(), ..source };
        let units = route_entries(&extracted, &textures, &staging).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].category, Category::Textures);
    }
}
