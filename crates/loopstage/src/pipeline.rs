//! The four-stage remediation pipeline.
//!
//! Inspect, plan, provision, migrate — strictly in that order, each stage
//! depending on the previous stage's postcondition. Execution is
//! single-threaded and blocking: this is a one-shot provisioning step driven
//! by an operator, and an interrupted copy simply leaves the backup as the
//! safe source for a retried run.

use std::path::Path;

use loopstage_common::{LoopstageError, LoopstageResult};
use serde::Serialize;

use crate::inspect::{FilesystemKind, inspect};
use crate::migrate::{MigrationReport, backup_path, migrate};
use crate::ops::SystemOps;
use crate::plan::{RemediationPlan, SizePolicy, plan};
use crate::provision::provision;

/// Result of a remediation run.
///
/// The presence of a plan and provisioned image in [`Self::Remediated`] is
/// what later reporting or cleanup logic keys on; there is no side-channel
/// "needed a fix" flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemediationOutcome {
    /// The backing filesystem already supports export; nothing was touched.
    AlreadyCapable(FilesystemKind),
    /// The volume was migrated onto a loopback image.
    Remediated {
        /// The plan the run executed.
        plan: RemediationPlan,
        /// What the migration did and whether the export probe passed.
        report: MigrationReport,
    },
}

/// Run the full remediation pipeline against `staging`.
///
/// Short-circuits without provisioning or copying when the backing
/// filesystem is already export-capable. When a previous run was interrupted
/// after the backup rename, the pipeline resumes from the backup instead of
/// a live tree.
pub fn remediate(
    staging: &Path,
    destination_parent: &Path,
    policy: &SizePolicy,
    ops: &dyn SystemOps,
) -> LoopstageResult<RemediationOutcome> {
    let backup = backup_path(staging);
    let resuming = !staging.exists() && backup.exists();

    if resuming {
        tracing::info!(
            staging = %staging.display(),
            backup = %backup.display(),
            "Staging directory absent but backup present; resuming interrupted migration"
        );
    } else if staging.exists() {
        let kind = inspect(staging, ops)?;
        if kind.is_export_capable() {
            tracing::info!(
                staging = %staging.display(),
                %kind,
                "Backing filesystem already export-capable, no remediation needed"
            );
            return Ok(RemediationOutcome::AlreadyCapable(kind));
        }
    } else {
        return Err(LoopstageError::Config {
            message: format!("staging directory {} does not exist", staging.display()),
        });
    }

    let plan = plan(staging, destination_parent, policy, ops)?;
    let image = provision(&plan, ops)?;
    let report = migrate(staging, &image, ops)?;

    Ok(RemediationOutcome::Remediated { plan, report })
}
