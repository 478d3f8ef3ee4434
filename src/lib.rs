pub mod backup;
pub mod classify;
pub mod config;
pub mod container;
pub mod error;
pub mod fsutil;
pub mod load_order;
pub mod merge;
pub mod planner;
pub mod plugin;
pub mod strings;
pub mod tool;

pub use backup::{BackupManager, BackupSnapshot, SnapshotState};
pub use classify::{Category, ContentKind, SourceFile};
pub use config::{CategorySettings, Compression, MergeConfig, VerifySeverity};
pub use container::{verify, ArchiveType, ContainerHeader, VerificationFailure};
pub use error::MergeError;
pub use merge::{restore, MergeReport, Merger, StageEvent};
pub use planner::{plan, ArchiveGroup};
pub use plugin::{write_descriptor, DescriptorFile, PluginHeader};
pub use tool::{Archive2, ArchiveTool, CancelToken, OutputContainer, VerifyStatus};
