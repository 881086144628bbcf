//! Error types for provisioning runs.

use thiserror::Error;

use crate::state::StageId;

/// Result alias used by stages and the orchestrator.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors that can occur while provisioning.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// A configuration value has the wrong shape.
    #[error("Invalid configuration for {key}: {message}")]
    Config { key: String, message: String },

    /// Package, toolchain or framework installation failed.
    #[error("Environment error in stage '{stage}': {message}")]
    Environment { stage: StageId, message: String },

    /// A repository could not be cloned.
    #[error("Source fetch failed in stage '{stage}': {message}")]
    SourceFetch { stage: StageId, message: String },

    /// One or more model assets could not be downloaded.
    #[error("Asset download failed: {message}")]
    AssetDownload { message: String },

    /// The server process could not be started.
    #[error("Launch failed: {message}")]
    Launch { message: String },

    /// Local filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Build a configuration error.
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Build an environment error for a stage.
    pub fn environment(stage: StageId, message: impl Into<String>) -> Self {
        Self::Environment {
            stage,
            message: message.into(),
        }
    }

    /// Build a source fetch error for a stage.
    pub fn source_fetch(stage: StageId, message: impl Into<String>) -> Self {
        Self::SourceFetch {
            stage,
            message: message.into(),
        }
    }

    /// The stage the error is attributed to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<StageId> {
        match self {
            Self::Environment { stage, .. } | Self::SourceFetch { stage, .. } => Some(*stage),
            Self::AssetDownload { .. } => Some(StageId::Assets),
            Self::Launch { .. } => Some(StageId::Launch),
            Self::Config { .. } | Self::Io(_) => None,
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}
