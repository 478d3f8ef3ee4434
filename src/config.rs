//! Merge configuration.
//!
//! [`MergeConfig`] carries every tunable of a run. It has working defaults,
//! can be loaded from a JSON file, and is further overridden by CLI flags.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classify::Category;
use crate::container::ArchiveType;
use crate::plugin::DescriptorOptions;

pub const GIB: u64 = 1024 * 1024 * 1024;
/// Uncompressed bytes per merged container before a new part is started.
pub const DEFAULT_CEILING: u64 = 7 * GIB;

// ── Compression ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Default,
}

impl Compression {
    /// Value of the archiving tool's `-compression=` switch.
    pub fn tool_value(self) -> &'static str {
        match self {
            Compression::None    => "None",
            Compression::Default => "Default",
        }
    }
}

/// How a failed header check is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VerifySeverity {
    /// Abort the run and restore the snapshot.
    Fatal,
    /// Log and keep going.
    Warn,
}

// ── CategorySettings ─────────────────────────────────────────────────────────

/// Per-category parameters handed to the archive invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategorySettings {
    pub format:      ArchiveType,
    pub compression: Compression,
    pub ceiling:     u64,
    /// Optional `-maxSizeMB=` passed through to the tool.
    pub max_part_mb: Option<u64>,
}

// ── MergeConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeConfig {
    /// Case-insensitive filename prefix of source containers.
    pub source_prefix:    String,
    /// Stem of every merged output; also excluded from the source scan.
    pub merged_name:      String,
    pub general_ceiling:  u64,
    pub texture_ceiling:  u64,
    pub audio_ceiling:    u64,
    pub verify:           VerifySeverity,
    /// Loose strings directory, relative to the content root.
    pub strings_dir:      String,
    pub author:           String,
    pub description:      String,
    pub record_count:     u32,
    /// Seconds to wait for the tool after cancellation before killing it.
    pub grace_period_secs: u64,
    pub max_part_mb:      Option<u64>,
    /// `plugins.txt` to register descriptors in, if any.
    pub load_order_file:  Option<PathBuf>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            source_prefix:     "cc".into(),
            merged_name:       "CCMerged".into(),
            general_ceiling:   DEFAULT_CEILING,
            texture_ceiling:   DEFAULT_CEILING,
            audio_ceiling:     DEFAULT_CEILING,
            verify:            VerifySeverity::Fatal,
            strings_dir:       "Strings".into(),
            author:            "ccpack".into(),
            description:       "Merged Creation Club content".into(),
            record_count:      0,
            grace_period_secs: 10,
            max_part_mb:       None,
            load_order_file:   None,
        }
    }
}

impl MergeConfig {
    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn settings(&self, category: Category) -> CategorySettings {
        let (format, compression, ceiling) = match category {
            Category::General  => (ArchiveType::General, Compression::Default, self.general_ceiling),
            Category::Textures => (ArchiveType::Textures, Compression::Default, self.texture_ceiling),
            // Compressed sound data is decoded with audible artifacts.
            Category::Audio    => (ArchiveType::General, Compression::None, self.audio_ceiling),
            Category::Strings  => (ArchiveType::General, Compression::None, u64::MAX),
        };
        CategorySettings { format, compression, ceiling, max_part_mb: self.max_part_mb }
    }

    pub fn descriptor_options(&self, category: Category) -> DescriptorOptions {
        DescriptorOptions {
            author:       self.author.clone(),
            description:  self.description.clone(),
            record_count: self.record_count,
            localized:    category.is_localizable(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_is_stored_uncompressed() {
        let cfg = MergeConfig::default();
        assert_eq!(cfg.settings(Category::Audio).compression, Compression::None);
        assert_eq!(cfg.settings(Category::General).compression, Compression::Default);
        assert_eq!(cfg.settings(Category::Textures).format, ArchiveType::Textures);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: MergeConfig =
            serde_json::from_str(r#"{"texture_ceiling": 3221225472, "verify": "warn"}"#).unwrap();
        assert_eq!(cfg.texture_ceiling, 3 * GIB);
        assert_eq!(cfg.verify, VerifySeverity::Warn);
        assert_eq!(cfg.general_ceiling, DEFAULT_CEILING);
        assert_eq!(cfg.merged_name, "CCMerged");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<MergeConfig>(r#"{"ceiling": 1}"#).is_err());
    }
}
