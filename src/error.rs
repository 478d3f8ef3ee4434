use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::backup::{BackupError, LockError, RestoreError};
use crate::container::VerificationFailure;
use crate::load_order::LoadOrderError;
use crate::plugin::PluginError;
use crate::strings::StringsError;
use crate::tool::InvocationError;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("content directory already holds a merge (snapshot {0}); restore or acknowledge it first")]
    AlreadyMerged(String),
    #[error("no source containers found in {}", .0.display())]
    NothingToMerge(PathBuf),
    #[error("merged output {} already exists; remove it or restore the previous merge", .0.display())]
    OutputExists(PathBuf),
    #[error("merge cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error(transparent)]
    Invocation(InvocationError),
    #[error("verification failed: {0}")]
    Verification(#[from] VerificationFailure),
    #[error("descriptor error: {0}")]
    Descriptor(#[from] PluginError),
    #[error(transparent)]
    Strings(#[from] StringsError),
    #[error(transparent)]
    LoadOrder(#[from] LoadOrderError),
    #[error("{cause}; rollback also failed: {restore}")]
    RollbackFailed { cause: Box<MergeError>, restore: RestoreError },
}

impl From<InvocationError> for MergeError {
    fn from(e: InvocationError) -> Self {
        match e {
            InvocationError::Cancelled { .. } => MergeError::Cancelled,
            other => MergeError::Invocation(other),
        }
    }
}
