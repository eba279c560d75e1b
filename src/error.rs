//! Failure taxonomy for the build pipeline.
//!
//! Stage code returns `anyhow::Result` like everything else in the crate. When a
//! failure belongs to one of the classes below it is raised as a
//! [`StageFailure`] inside the `anyhow::Error`, so callers can recover the class
//! with [`failure_class`] (the CLI maps it to an exit code).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageFailure {
    /// The recipe is invalid: unpinned reference, unknown feature, bad path.
    #[error("invalid recipe: {0}")]
    Recipe(String),

    /// The compiler exited non-zero.
    #[error("compilation failed for '{bin}' ({status})")]
    Compile { bin: String, status: String },

    /// The artifact is not where the stage definitions say it is.
    #[error("build artifact missing at '{path}': {reason}")]
    MissingArtifact { path: String, reason: String },

    /// The pinned base rootfs could not be resolved or failed its digest check.
    #[error("base image '{reference}' unusable: {reason}")]
    BaseImage { reference: String, reason: String },

    /// Package index refresh, trust package install or bundle copy failed.
    #[error("trust provisioning failed during {step}: {reason}")]
    TrustProvisioning { step: String, reason: String },
}

impl StageFailure {
    /// Short machine-readable class name, recorded in run manifests.
    pub fn class(&self) -> &'static str {
        match self {
            StageFailure::Recipe(_) => "recipe",
            StageFailure::Compile { .. } => "compile",
            StageFailure::MissingArtifact { .. } => "missing_artifact",
            StageFailure::BaseImage { .. } => "base_image",
            StageFailure::TrustProvisioning { .. } => "trust_provisioning",
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            StageFailure::Recipe(_) => 1,
            StageFailure::Compile { .. } => 2,
            StageFailure::MissingArtifact { .. } => 3,
            StageFailure::TrustProvisioning { .. } => 4,
            StageFailure::BaseImage { .. } => 5,
        }
    }
}

/// Find the typed failure anywhere in an error chain.
pub fn failure_class(err: &anyhow::Error) -> Option<&StageFailure> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<StageFailure>())
}
