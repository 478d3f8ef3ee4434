//! The merge run.
//!
//! ```text
//! lock → guard → scan → snapshot → extract → strings → route → plan
//!      → record outputs → { pack → verify → descriptor } per group
//!      → load order → cleanup
//! ```
//!
//! Nothing in the content directory changes before the snapshot is taken.
//! Any failure after that point restores the snapshot before the error is
//! returned, so a run either completes or leaves the directory as it found
//! it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backup::{BackupManager, BackupSnapshot, RestoreError, RestoreReport, RunLock, DISPLACED_DIR};
use crate::classify::{self, Category, Scan, SourceFile};
use crate::config::{MergeConfig, VerifySeverity};
use crate::container::{self, VerificationFailure};
use crate::error::MergeError;
use crate::load_order;
use crate::planner::{self, ArchiveGroup};
use crate::plugin::{self, DescriptorFile};
use crate::strings::{self, StringsExtractor};
use crate::tool::{self, ArchiveTool, CancelToken, OutputContainer, VerifyStatus};

/// Scratch directory under the content root; removed when a run ends.
pub const STAGING_DIR: &str = ".ccpack_staging";

// ── Progress ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    Scanned { sources: usize, skipped: usize },
    SnapshotTaken { id: String, files: usize },
    Extracted { container: String },
    StringsMoved { count: usize },
    Planned { category: Category, groups: usize },
    Packing { container: String, index: usize, total: usize },
    Verified { container: String, status: VerifyStatus },
    DescriptorWritten { name: String },
    RolledBack { snapshot: String },
    Completed { outputs: usize },
}

// ── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub snapshot_id:   String,
    pub run_id:        Uuid,
    pub outputs:       Vec<OutputContainer>,
    pub descriptors:   Vec<DescriptorFile>,
    pub strings_moved: usize,
    /// Files that looked like sources but could not be used.
    pub skipped:       Vec<(PathBuf, String)>,
    /// Verification failures tolerated under [`VerifySeverity::Warn`].
    pub warnings:      Vec<VerificationFailure>,
}

// ── Merger ───────────────────────────────────────────────────────────────────

pub struct Merger<'a> {
    root:   PathBuf,
    config: MergeConfig,
    tool:   &'a dyn ArchiveTool,
    events: Option<Sender<StageEvent>>,
    cancel: CancelToken,
}

impl<'a> Merger<'a> {
    pub fn new(root: &Path, config: MergeConfig, tool: &'a dyn ArchiveTool) -> Self {
        Self {
            root: root.to_owned(),
            config,
            tool,
            events: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_events(mut self, events: Sender<StageEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn emit(&self, event: StageEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    fn check_cancel(&self) -> Result<(), MergeError> {
        if self.cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        Ok(())
    }

    /// Plan the merge from container sizes without touching anything.
    pub fn plan_only(&self) -> Result<Vec<ArchiveGroup>, MergeError> {
        let scan = self.scan()?;
        let mut units = Vec::with_capacity(scan.sources.len());
        for source in &scan.sources {
            units.push(SourceFile {
                path:      source.path.clone(),
                container: source.name.clone(),
                category:  source.category,
                size:      source.size,
                kind:      classify::ContentKind::Other,
            });
        }
        Ok(self.plan_groups(units))
    }

    fn scan(&self) -> Result<Scan, MergeError> {
        let scan = classify::scan_sources(&self.root, &self.config.source_prefix, &self.config.merged_name)?;
        self.emit(StageEvent::Scanned { sources: scan.sources.len(), skipped: scan.skipped.len() });
        Ok(scan)
    }

    fn plan_groups(&self, units: Vec<SourceFile>) -> Vec<ArchiveGroup> {
        let mut by_category = classify::by_category(units);
        let mut groups = Vec::new();
        for category in Category::PACKED {
            let Some(files) = by_category.remove(&category) else {
                continue;
            };
            let ceiling = self.config.settings(category).ceiling;
            let planned = planner::plan(category, files, ceiling, &self.config.merged_name);
            self.emit(StageEvent::Planned { category, groups: planned.len() });
            groups.extend(planned);
        }
        groups
    }

    /// Run the merge.
    pub fn run(&self) -> Result<MergeReport, MergeError> {
        let _lock = RunLock::acquire(&self.root)?;
        let backups = BackupManager::new(&self.root);

        if let Some(snapshot) = backups.current()? {
            if snapshot.blocks_merge() {
                return Err(MergeError::AlreadyMerged(snapshot.id));
            }
        }

        let scan = self.scan()?;
        if let Some(existing) = scan.merged_outputs.first() {
            return Err(MergeError::OutputExists(existing.clone()));
        }
        if scan.sources.is_empty() {
            return Err(MergeError::NothingToMerge(self.root.clone()));
        }
        self.check_cancel()?;

        let sources: Vec<PathBuf> = scan.sources.iter().map(|s| s.path.clone()).collect();
        let mut snapshot = backups.snapshot(&sources)?;
        self.emit(StageEvent::SnapshotTaken { id: snapshot.id.clone(), files: snapshot.entries.len() });

        let staging = self.root.join(STAGING_DIR);
        let result = self.merge_snapshot(&backups, &mut snapshot, scan, &staging);
        let result = match result {
            Ok(report) => Ok(report),
            Err(cause) => {
                warn!(error = %cause, snapshot = %snapshot.id, "merge failed, restoring snapshot");
                match restore_snapshot(&backups, &self.config) {
                    Ok(_) => {
                        self.emit(StageEvent::RolledBack { snapshot: snapshot.id.clone() });
                        Err(cause)
                    }
                    Err(restore) => Err(MergeError::RollbackFailed { cause: Box::new(cause), restore }),
                }
            }
        };

        if staging.exists() {
            if let Err(e) = fs::remove_dir_all(&staging) {
                warn!(dir = %staging.display(), error = %e, "could not remove staging directory");
            }
        }
        result
    }

    fn merge_snapshot(
        &self,
        backups: &BackupManager,
        snapshot: &mut BackupSnapshot,
        scan: Scan,
        staging: &Path,
    ) -> Result<MergeReport, MergeError> {
        if staging.exists() {
            debug!(dir = %staging.display(), "removing stale staging directory");
            fs::remove_dir_all(staging)?;
        }

        // ── Extract and route ────────────────────────────────────────────────
        let extract_root = staging.join("extract");
        let snapshot_dir = backups.snapshot_dir(&snapshot.id);
        if strings::retire(&self.root, &snapshot_dir)? {
            warn!("found a strings manifest from an earlier run; its moves are kept");
        }
        let displaced = snapshot_dir.join(DISPLACED_DIR);
        let mut strings = StringsExtractor::new(&self.root, &self.config.strings_dir, displaced)?;
        let mut strings_moved = 0;
        let mut units = Vec::new();

        for (source, entry) in scan.sources.iter().zip(&snapshot.entries) {
            self.check_cancel()?;
            let tree = extract_root.join(source.stem());
            self.tool.extract(&entry.backup, &tree, &self.cancel)?;
            self.emit(StageEvent::Extracted { container: source.name.clone() });

            strings_moved += strings.extract_tree(&source.name, &tree)?;
            units.extend(classify::route_entries(&tree, source, staging)?);
        }
        self.emit(StageEvent::StringsMoved { count: strings_moved });

        // ── Plan ─────────────────────────────────────────────────────────────
        let groups = self.plan_groups(units);
        let planned: Vec<PathBuf> = groups
            .iter()
            .flat_map(|g| [self.root.join(g.container_name()), self.root.join(g.descriptor_name())])
            .collect();
        backups.record_outputs(snapshot, &planned)?;

        // ── Build ────────────────────────────────────────────────────────────
        let mut outputs = Vec::with_capacity(groups.len());
        let mut descriptors = Vec::with_capacity(groups.len());
        let mut warnings = Vec::new();
        let total = groups.len();

        for (index, group) in groups.iter().enumerate() {
            self.check_cancel()?;
            let settings = self.config.settings(group.category);
            self.emit(StageEvent::Packing { container: group.container_name(), index: index + 1, total });

            let group_root = staging.join("groups").join(&group.stem);
            let mut output = tool::invoke(self.tool, group, &settings, &group_root, &self.root, &self.cancel)?;
            backups.record_outputs(snapshot, &output.extra_parts)?;

            match container::verify(&output.path, settings.format) {
                Ok(()) => output.status = VerifyStatus::Pass,
                Err(failure) => {
                    output.status = VerifyStatus::Fail;
                    match self.config.verify {
                        VerifySeverity::Fatal => return Err(failure.into()),
                        VerifySeverity::Warn => {
                            warn!(%failure, "keeping container that failed verification");
                            warnings.push(failure);
                        }
                    }
                }
            }
            self.emit(StageEvent::Verified { container: output.name.clone(), status: output.status });

            let descriptor = plugin::write_descriptor(
                &self.root,
                &group.stem,
                &output.name,
                &self.config.descriptor_options(group.category),
            )?;
            self.emit(StageEvent::DescriptorWritten { name: descriptor.name.clone() });

            if let Err(e) = fs::remove_dir_all(&group_root) {
                debug!(dir = %group_root.display(), error = %e, "could not clear group staging");
            }
            info!(
                container = %output.name,
                descriptor = %descriptor.name,
                bytes = output.size,
                oversized = group.oversized,
                "container ready"
            );
            outputs.push(output);
            descriptors.push(descriptor);
        }

        // ── Register ─────────────────────────────────────────────────────────
        if let Some(path) = &self.config.load_order_file {
            let names: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
            load_order::register(path, &names)?;
        }

        self.emit(StageEvent::Completed { outputs: outputs.len() });
        info!(snapshot = %snapshot.id, outputs = outputs.len(), strings = strings_moved, "merge complete");

        Ok(MergeReport {
            snapshot_id: snapshot.id.clone(),
            run_id: snapshot.run_id,
            outputs,
            descriptors,
            strings_moved,
            skipped: scan.skipped,
            warnings,
        })
    }
}

/// Undo the last merge under `root`, including any staging left by a run
/// that was killed.
pub fn restore(root: &Path, config: &MergeConfig) -> Result<RestoreReport, MergeError> {
    let _lock = RunLock::acquire(root)?;
    let report = restore_snapshot(&BackupManager::new(root), config)?;
    let staging = root.join(STAGING_DIR);
    if staging.exists() {
        debug!(dir = %staging.display(), "removing leftover staging directory");
        fs::remove_dir_all(&staging)?;
    }
    Ok(report)
}

fn restore_snapshot(backups: &BackupManager, config: &MergeConfig) -> Result<RestoreReport, RestoreError> {
    let report = backups.restore()?;
    if let Some(path) = &config.load_order_file {
        // The originals are back at this point; a stale entry for a missing
        // plugin is skipped by the game.
        if let Err(e) = load_order::unregister(path, &report.descriptor_names()) {
            warn!(error = %e, "could not remove merged plugins from the load order");
        }
    }
    Ok(report)
}
