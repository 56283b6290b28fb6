//! Migration of a staging tree onto a provisioned loopback image.
//!
//! The only stage with durable side effects beyond file creation. Each step
//! is a commit point that must survive interruption without data loss: the
//! renamed backup is the durability anchor, and the mount swap happens only
//! after the copy is complete and the scratch mount is cleanly unmounted.

use std::path::{Path, PathBuf};

use loopstage_common::{LoopstageError, LoopstageResult};
use serde::Serialize;

use crate::ops::SystemOps;
use crate::provision::LoopbackImage;

/// Where the live tree is renamed to when a migration begins.
#[must_use]
pub fn backup_path(staging: &Path) -> PathBuf {
    sibling_with_suffix(staging, "_original")
}

/// Scratch mount point used for the copy phase, never the final path.
#[must_use]
pub fn scratch_path(staging: &Path) -> PathBuf {
    sibling_with_suffix(staging, "_stage")
}

fn sibling_with_suffix(staging: &Path, suffix: &str) -> PathBuf {
    let name = staging
        .file_name()
        .map_or_else(|| "staging".to_string(), |n| n.to_string_lossy().into_owned());
    staging.with_file_name(format!("{name}{suffix}"))
}

/// Outcome of a completed migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// The staging path, now backed by the loopback image.
    pub staging_path: PathBuf,
    /// The preserved original tree. Discarding it is an operator decision.
    pub backup_path: PathBuf,
    /// The image file now mounted at the staging path.
    pub image_path: PathBuf,
    /// Whether this run resumed from an existing backup.
    pub resumed: bool,
    /// Whether the post-swap export probe succeeded.
    pub verified: bool,
    /// Probe diagnostic when verification failed.
    pub warning: Option<String>,
}

/// Migrate the tree at `staging` onto `image` and swap the mount in place.
///
/// On success `staging` resolves to the export-capable loopback filesystem
/// and the original tree remains at `<staging>_original`. A failure before
/// the swap returns [`LoopstageError::MigrationInterrupted`], leaves the
/// backup (if created) intact, and never attempts the swap; a re-run resumes
/// the copy from the backup.
///
/// A failed export probe after the swap is a warning on the report, not an
/// error: the swap already stands as the best available outcome, and the
/// operator can retry the downstream flashing step with the diagnostic.
pub fn migrate(
    staging: &Path,
    image: &LoopbackImage,
    ops: &dyn SystemOps,
) -> LoopstageResult<MigrationReport> {
    let backup = backup_path(staging);
    let scratch = scratch_path(staging);

    // Step 1: mount at a scratch point, never the final path yet.
    std::fs::create_dir_all(&scratch)
        .map_err(|e| LoopstageError::interrupted("scratch mount", e.into()))?;
    if let Err(err) = ops.mount_image(&image.path, &scratch) {
        remove_scratch_dir(&scratch);
        return Err(LoopstageError::interrupted("scratch mount", err));
    }

    // Step 2: establish the backup and copy from it. The backup, not the
    // live tree, is always the copy source, so an interrupted run never
    // re-reads a vanished source.
    let resumed = backup.exists();
    if resumed {
        tracing::info!(backup = %backup.display(), "Resuming copy from existing backup");
    } else if let Err(err) = ops.rename_dir(staging, &backup) {
        teardown_scratch(&scratch, ops);
        return Err(LoopstageError::interrupted("backup rename", err));
    }
    if let Err(err) = ops.copy_tree(&backup, &scratch) {
        teardown_scratch(&scratch, ops);
        return Err(LoopstageError::interrupted("copy", err));
    }

    // Step 3: release the scratch mount.
    ops.unmount(&scratch)
        .map_err(|e| LoopstageError::interrupted("scratch unmount", e))?;
    if let Err(err) = std::fs::remove_dir(&scratch) {
        tracing::warn!(scratch = %scratch.display(), %err, "Could not remove scratch mount point");
    }

    // Step 4: the swap. From here `staging` resolves to the new backing
    // store.
    std::fs::create_dir_all(staging)
        .map_err(|e| LoopstageError::interrupted("swap", e.into()))?;
    ops.mount_image(&image.path, staging)
        .map_err(|e| LoopstageError::interrupted("swap", e))?;

    tracing::info!(
        staging = %staging.display(),
        image = %image.path.display(),
        "Loopback volume swapped into place"
    );

    // Step 5: verify the export capability. Advisory only; the swap stands.
    let (verified, warning) = match ops.export_probe(staging) {
        Ok(()) => (true, None),
        Err(err) => {
            tracing::warn!(
                staging = %staging.display(),
                %err,
                "Export probe failed after swap; retry the flashing step manually"
            );
            (false, Some(err.to_string()))
        }
    };

    Ok(MigrationReport {
        staging_path: staging.to_path_buf(),
        backup_path: backup,
        image_path: image.path.clone(),
        resumed,
        verified,
        warning,
    })
}

/// Best-effort teardown after a failure during the copy phase; the original
/// error stays the reported cause.
fn teardown_scratch(scratch: &Path, ops: &dyn SystemOps) {
    if let Err(err) = ops.unmount(scratch) {
        tracing::warn!(scratch = %scratch.display(), %err, "Scratch unmount failed during teardown");
    }
    remove_scratch_dir(scratch);
}

fn remove_scratch_dir(scratch: &Path) {
    if let Err(err) = std::fs::remove_dir(scratch) {
        tracing::debug!(scratch = %scratch.display(), %err, "Scratch mount point left behind");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_is_sibling_with_suffix() {
        assert_eq!(
            backup_path(Path::new("/data/l4t/rootfs")),
            PathBuf::from("/data/l4t/rootfs_original")
        );
    }

    #[test]
    fn scratch_is_sibling_with_suffix() {
        assert_eq!(
            scratch_path(Path::new("/data/l4t/rootfs")),
            PathBuf::from("/data/l4t/rootfs_stage")
        );
    }
}
