//! Error taxonomy for the build and launch sequence.
//!
//! Every stage failure is fatal. Handlers return `anyhow::Result` with one of
//! these as the root cause; callers locate it with [`BuildError::find`] to pick
//! an exit code.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("base runtime unavailable: python {version}: {reason}")]
    BaseImageUnavailable { version: String, reason: String },

    #[error("dependency resolution failed: {reason}")]
    DependencyResolutionError { reason: String },

    #[error("privilege provisioning failed: {reason}")]
    PrivilegeProvisioningError { reason: String },

    #[error("entrypoint launch failed (exit code {code}): {reason}")]
    EntrypointLaunchFailure { reason: String, code: i32 },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("image '{name}' not found. Run 'pyship build' first.")]
    ImageNotFound { name: String },
}

impl BuildError {
    pub fn dependency(reason: impl Into<String>) -> Self {
        Self::DependencyResolutionError {
            reason: reason.into(),
        }
    }

    pub fn privilege(reason: impl Into<String>) -> Self {
        Self::PrivilegeProvisioningError {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind, used in logs and stage records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BaseImageUnavailable { .. } => "BaseImageUnavailable",
            Self::DependencyResolutionError { .. } => "DependencyResolutionError",
            Self::PrivilegeProvisioningError { .. } => "PrivilegeProvisioningError",
            Self::EntrypointLaunchFailure { .. } => "EntrypointLaunchFailure",
            Self::InvalidConfig { .. } => "InvalidConfig",
            Self::ImageNotFound { .. } => "ImageNotFound",
        }
    }

    /// Process exit code for this failure.
    ///
    /// A launch failure carries the code of the process that failed to start;
    /// everything else is a plain non-zero status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::EntrypointLaunchFailure { code, .. } => *code,
            _ => 1,
        }
    }

    /// Find the first `BuildError` anywhere in an error chain.
    pub fn find(err: &anyhow::Error) -> Option<&BuildError> {
        err.chain().find_map(|e| e.downcast_ref::<BuildError>())
    }
}

/// Exit code for an arbitrary error: the typed code if present, else 1.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    BuildError::find(err).map(BuildError::exit_code).unwrap_or(1)
}
