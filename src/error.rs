//! Error types for slot lifecycle operations.

use std::io;

use thiserror::Error;

use crate::slot::SlotId;

/// Errors reported synchronously by process and registry operations.
///
/// Stream I/O failures never show up here; they are absorbed by the cleanup
/// path and surface only as an exit code.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// `start` was called while a run is still active.
    #[error("{0} is already running")]
    AlreadyRunning(SlotId),

    /// `stop` or input was addressed to a slot with no active run.
    #[error("{0} is not running")]
    NotRunning(SlotId),

    /// The slot is not registered.
    #[error("{0} is not configured")]
    UnknownSlot(SlotId),

    /// The slot is already registered.
    #[error("{0} is already configured")]
    SlotExists(SlotId),

    /// Removal was requested while the slot still has a live process.
    #[error("{0} must be stopped before it can be removed")]
    SlotRunning(SlotId),

    /// The command for the slot could not be resolved from configuration.
    #[error("cannot build command for {slot}: {reason}")]
    Command { slot: SlotId, reason: String },

    /// The OS refused to spawn the process.
    #[error("could not start {slot} ({program}): {source}")]
    Spawn {
        slot: SlotId,
        program: String,
        #[source]
        source: io::Error,
    },

    /// The child was spawned without the piped handles we asked for.
    #[error("{0} was spawned without piped stdio")]
    MissingStdio(SlotId),
}

impl LaunchError {
    /// The slot the error refers to.
    pub fn slot(&self) -> SlotId {
        match self {
            LaunchError::AlreadyRunning(slot)
            | LaunchError::NotRunning(slot)
            | LaunchError::UnknownSlot(slot)
            | LaunchError::SlotExists(slot)
            | LaunchError::SlotRunning(slot)
            | LaunchError::MissingStdio(slot) => *slot,
            LaunchError::Command { slot, .. } | LaunchError::Spawn { slot, .. } => *slot,
        }
    }

    /// Whether a `start` attempt got as far as launching and then failed, as
    /// opposed to being rejected because of the slot's current state.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            LaunchError::Command { .. } | LaunchError::Spawn { .. } | LaunchError::MissingStdio(_)
        )
    }
}
