//! Error taxonomy for the loopstage pipeline.
//!
//! Every failure leaves the disk in one of three shapes: nothing touched,
//! Backup present with no swap performed, or swap performed with a
//! verification warning. Variants map onto those shapes so callers can
//! decide fatal-versus-advisory deliberately instead of suppressing.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`LoopstageError`].
pub type LoopstageResult<T> = Result<T, LoopstageError>;

/// Errors across the loopstage pipeline.
#[derive(Error, Diagnostic, Debug)]
pub enum LoopstageError {
    /// The destination cannot hold the planned image.
    #[error("insufficient space: need {required} bytes, {available} available")]
    #[diagnostic(
        code(loopstage::plan::insufficient_space),
        help("Free up space at the destination, or re-plan with --dest pointing at a larger filesystem")
    )]
    InsufficientSpace {
        /// Bytes the planned image requires.
        required: u64,
        /// Bytes available on the destination filesystem.
        available: u64,
    },

    /// Allocating or formatting the loopback image failed.
    ///
    /// Fatal to the run. No mount exists at this point, so the filesystem
    /// is left exactly as found.
    #[error("provisioning failed: {reason}")]
    #[diagnostic(code(loopstage::provision::failed))]
    ProvisionFailed {
        /// What went wrong during allocation or formatting.
        reason: String,
    },

    /// The copy or a mount/unmount failed mid-migration.
    ///
    /// Recoverable: the Backup directory, if created, remains and a re-run
    /// resumes the copy from it. The mount swap was not attempted.
    #[error("migration interrupted during {step}")]
    #[diagnostic(
        code(loopstage::migrate::interrupted),
        help("The *_original backup is intact; re-run remediation to resume from it")
    )]
    MigrationInterrupted {
        /// The migration step that failed.
        step: String,
        /// Underlying cause.
        #[source]
        source: Box<LoopstageError>,
    },

    /// The post-swap export probe did not succeed.
    ///
    /// Advisory only: the swap stands and this never unwinds it. Carried in
    /// reports and JSON output, not raised to abort the pipeline.
    #[error("export verification failed for {path}: {detail}")]
    #[diagnostic(
        code(loopstage::migrate::verification),
        help("The volume swap is complete; retry the downstream export/flash step manually")
    )]
    VerificationFailed {
        /// Path that failed the probe.
        path: String,
        /// Probe diagnostic.
        detail: String,
    },

    /// The mount table could not be read or matched against the path.
    #[error("mount table error: {message}")]
    #[diagnostic(code(loopstage::inspect::mount_table))]
    MountTable {
        /// The error message.
        message: String,
    },

    /// An external program exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    #[diagnostic(code(loopstage::ops::command))]
    CommandFailed {
        /// Program that was invoked.
        program: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Invalid byte-quantity format.
    #[error("invalid byte quantity: {value}")]
    #[diagnostic(
        code(loopstage::bytes::invalid),
        help("Use formats like '6Gi', '512Mi', '1G', or a plain byte count")
    )]
    InvalidQuantity {
        /// The invalid value.
        value: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(loopstage::io))]
    Io(#[from] std::io::Error),

    /// Feature not supported on this platform.
    #[error("feature not supported: {feature}")]
    #[diagnostic(
        code(loopstage::unsupported),
        help("Loopback remediation requires a Linux host")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    #[diagnostic(code(loopstage::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl LoopstageError {
    /// Wrap an error as a migration interruption at the named step.
    #[must_use]
    pub fn interrupted(step: &str, source: LoopstageError) -> Self {
        Self::MigrationInterrupted {
            step: step.to_string(),
            source: Box::new(source),
        }
    }

    /// Whether a re-run can recover from this error without operator surgery.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientSpace { .. }
                | Self::MigrationInterrupted { .. }
                | Self::VerificationFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_space_display() {
        let err = LoopstageError::InsufficientSpace {
            required: 6_442_450_944,
            available: 3_221_225_472,
        };
        assert_eq!(
            err.to_string(),
            "insufficient space: need 6442450944 bytes, 3221225472 available"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LoopstageError = io_err.into();
        assert!(matches!(err, LoopstageError::Io(_)));
    }

    #[test]
    fn interrupted_wraps_source() {
        let inner = LoopstageError::Io(std::io::Error::other("copy died"));
        let err = LoopstageError::interrupted("copy", inner);
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "migration interrupted during copy");
    }

    #[test]
    fn provision_failed_is_fatal() {
        let err = LoopstageError::ProvisionFailed {
            reason: "mkfs.ext4 not found".to_string(),
        };
        assert!(!err.is_recoverable());
    }
}
