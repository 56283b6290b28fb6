//! Loopback image provisioning.

use std::path::PathBuf;

use loopstage_common::{LoopstageError, LoopstageResult};
use serde::Serialize;

use crate::ops::SystemOps;
use crate::plan::RemediationPlan;

/// A provisioned loopback image file.
///
/// Owned by the provisioner until handed to the migration executor. The file
/// is the staging volume's new permanent backing store; it is never
/// self-cleaned on success and only an explicit operator action removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopbackImage {
    /// Path of the image file.
    pub path: PathBuf,
    /// Planned size in bytes.
    pub size_bytes: u64,
}

/// Allocate and format the loopback image described by `plan`.
///
/// If a file already exists at the planned path it is reused as-is, without
/// re-validating its size or format. That is a deliberate idempotence
/// shortcut for resumed runs; a corrupt or undersized leftover is not
/// detected here, and surfaces later when the mount or copy fails.
///
/// Never mounts anything. On failure the partial file is removed, so the
/// filesystem is left exactly as found.
pub fn provision(plan: &RemediationPlan, ops: &dyn SystemOps) -> LoopstageResult<LoopbackImage> {
    let image = LoopbackImage {
        path: plan.image_path.clone(),
        size_bytes: plan.image_size_bytes,
    };

    if plan.image_path.exists() {
        tracing::info!(
            image = %plan.image_path.display(),
            "Image file already present, reusing without re-validation"
        );
        return Ok(image);
    }

    if let Err(err) = ops.allocate_file(&plan.image_path, plan.image_size_bytes) {
        remove_partial(&plan.image_path);
        return Err(LoopstageError::ProvisionFailed {
            reason: format!("allocating {}: {err}", plan.image_path.display()),
        });
    }

    if let Err(err) = ops.format_image(&plan.image_path) {
        remove_partial(&plan.image_path);
        return Err(LoopstageError::ProvisionFailed {
            reason: format!("formatting {}: {err}", plan.image_path.display()),
        });
    }

    tracing::info!(
        image = %plan.image_path.display(),
        size_bytes = plan.image_size_bytes,
        "Loopback image provisioned"
    );
    Ok(image)
}

fn remove_partial(path: &std::path::Path) {
    if path.exists() {
        if let Err(err) = std::fs::remove_file(path) {
            tracing::warn!(image = %path.display(), %err, "Failed to remove partial image");
        }
    }
}
