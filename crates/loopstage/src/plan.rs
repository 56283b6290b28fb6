//! Capacity planning for the replacement loopback volume.

use std::path::{Path, PathBuf};

use loopstage_common::{ByteSize, LoopstageError, LoopstageResult};
use serde::Serialize;

use crate::migrate::backup_path;
use crate::ops::SystemOps;

/// Sizing policy for the loopback image.
///
/// The defaults (30% headroom, 6 GiB floor) match the provisioning flow this
/// component was extracted from; both are operator-tunable policy rather
/// than hard-coded law. The headroom absorbs filesystem metadata overhead
/// and transient files generated during formatting and copy; the floor
/// protects small trees where that overhead would exceed 30%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizePolicy {
    /// Headroom applied on top of the measured tree size, in percent.
    pub headroom_percent: u32,
    /// Absolute minimum image size in bytes, regardless of measured size.
    pub min_image_bytes: u64,
}

impl Default for SizePolicy {
    fn default() -> Self {
        Self {
            headroom_percent: 30,
            min_image_bytes: ByteSize::gibibytes(6).as_bytes(),
        }
    }
}

impl SizePolicy {
    /// Image size for a measured tree of `tree_bytes`.
    #[must_use]
    pub fn image_size(&self, tree_bytes: u64) -> u64 {
        // All arithmetic in u128: an operator-supplied headroom near
        // u32::MAX must saturate, not overflow.
        let factor = 100u128 + u128::from(self.headroom_percent);
        let padded = (u128::from(tree_bytes) * factor).div_ceil(100);
        let padded = u64::try_from(padded).unwrap_or(u64::MAX);
        padded.max(self.min_image_bytes)
    }
}

/// An immutable remediation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationPlan {
    /// The staging directory being remediated.
    pub staging_path: PathBuf,
    /// Directory that will hold the image file.
    pub destination_parent: PathBuf,
    /// Where the loopback image file will live.
    pub image_path: PathBuf,
    /// Planned image size in bytes.
    pub image_size_bytes: u64,
    /// Bytes free at the destination when the plan was computed.
    pub available_bytes_at_destination: u64,
}

/// Default destination for the image: a sibling of the staging volume's
/// parent directory.
#[must_use]
pub fn default_destination(staging: &Path) -> PathBuf {
    staging
        .parent()
        .and_then(Path::parent)
        .or_else(|| staging.parent())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Compute a remediation plan for `staging`.
///
/// Measures the tree, applies the size policy, and validates free space at
/// `destination_parent`. Fails fast with [`LoopstageError::InsufficientSpace`]
/// rather than letting a doomed copy start; the caller may re-plan with an
/// alternate destination. No mutation beyond stat calls.
///
/// When a prior run already renamed the staging directory to its backup, the
/// backup is measured instead, so a resumed run plans against the data it
/// will actually copy.
pub fn plan(
    staging: &Path,
    destination_parent: &Path,
    policy: &SizePolicy,
    ops: &dyn SystemOps,
) -> LoopstageResult<RemediationPlan> {
    let backup = backup_path(staging);
    let measure_source = if staging.exists() {
        staging
    } else if backup.exists() {
        tracing::info!(backup = %backup.display(), "Staging directory gone, measuring backup");
        backup.as_path()
    } else {
        return Err(LoopstageError::Config {
            message: format!(
                "nothing to plan: neither {} nor {} exists",
                staging.display(),
                backup.display()
            ),
        });
    };

    let tree_bytes = ops.tree_size(measure_source)?;
    let image_size_bytes = policy.image_size(tree_bytes);
    let available = ops.free_space(destination_parent)?;

    tracing::info!(
        staging = %staging.display(),
        tree_bytes,
        image_size_bytes,
        available,
        "Computed remediation plan"
    );

    if available < image_size_bytes {
        return Err(LoopstageError::InsufficientSpace {
            required: image_size_bytes,
            available,
        });
    }

    let name = staging
        .file_name()
        .map_or_else(|| "staging".to_string(), |n| n.to_string_lossy().into_owned());

    Ok(RemediationPlan {
        staging_path: staging.to_path_buf(),
        destination_parent: destination_parent.to_path_buf(),
        image_path: destination_parent.join(format!("{name}.img")),
        image_size_bytes,
        available_bytes_at_destination: available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn floor_applies_to_small_trees() {
        let policy = SizePolicy::default();
        assert_eq!(policy.image_size(0), 6 * GIB);
        assert_eq!(policy.image_size(100 * 1024 * 1024), 6 * GIB);
        // 4 GiB padded to 5.2 GiB still sits under the floor.
        assert_eq!(policy.image_size(4 * GIB), 6 * GIB);
    }

    #[test]
    fn headroom_applies_to_large_trees() {
        let policy = SizePolicy::default();
        let tree = 20 * GIB;
        assert_eq!(policy.image_size(tree), 26 * GIB);
    }

    #[test]
    fn padding_rounds_up() {
        let policy = SizePolicy::default();
        // 13 * 10^10 / 10 is exact; one more byte must round up.
        let exact = 10_000_000_000u64;
        assert_eq!(policy.image_size(exact), 13_000_000_000);
        assert_eq!(policy.image_size(exact + 1), 13_000_000_002);
    }

    #[test]
    fn extreme_headroom_does_not_overflow() {
        let policy = SizePolicy {
            headroom_percent: u32::MAX,
            min_image_bytes: GIB,
        };
        // (100 + u32::MAX) would overflow in u32; the padded size is exact.
        assert_eq!(policy.image_size(100), 4_294_967_395);
        assert_eq!(policy.image_size(u64::MAX), u64::MAX);
    }

    #[test]
    fn custom_policy_respected() {
        let policy = SizePolicy {
            headroom_percent: 10,
            min_image_bytes: GIB,
        };
        assert_eq!(policy.image_size(10 * GIB), 11 * GIB);
        assert_eq!(policy.image_size(0), GIB);
    }

    #[test]
    fn default_destination_is_grandparent() {
        assert_eq!(
            default_destination(Path::new("/data/Linux_for_Tegra/rootfs")),
            PathBuf::from("/data")
        );
        assert_eq!(default_destination(Path::new("/rootfs")), PathBuf::from("/"));
    }

    proptest! {
        #[test]
        fn image_size_is_max_of_floor_and_padded(tree in 0u64..=(1 << 50)) {
            let policy = SizePolicy::default();
            let expected = ((u128::from(tree) * 130).div_ceil(100) as u64).max(6 * GIB);
            prop_assert_eq!(policy.image_size(tree), expected);
        }

        #[test]
        fn image_size_never_below_floor(tree in 0u64..=(1 << 50)) {
            prop_assert!(SizePolicy::default().image_size(tree) >= 6 * GIB);
        }
    }
}
