//! Volume inspection: classify a staging directory's backing filesystem.
//!
//! Live-USB hosts commonly root their writable layer in an overlay
//! filesystem, which the kernel NFS server refuses to export. The inspector
//! detects that incompatibility before any expensive copy begins, so the
//! downstream flashing tool never fails opaquely deep into its own run.

use std::fmt;
use std::path::Path;

use loopstage_common::LoopstageResult;
use serde::Serialize;

use crate::ops::SystemOps;

/// Filesystem classification for a staging volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    /// ext2/ext3/ext4.
    Ext,
    /// XFS.
    Xfs,
    /// Btrfs.
    Btrfs,
    /// Overlay/union filesystems.
    Overlay,
    /// tmpfs and other memory-backed filesystems.
    Tmpfs,
    /// Anything unrecognized, carrying the raw fstype string.
    Other(String),
}

impl FilesystemKind {
    /// Classify a raw mount-table fstype string.
    #[must_use]
    pub fn from_fstype(fstype: &str) -> Self {
        match fstype {
            "ext2" | "ext3" | "ext4" => Self::Ext,
            "xfs" => Self::Xfs,
            "btrfs" => Self::Btrfs,
            "overlay" | "overlayfs" | "aufs" => Self::Overlay,
            "tmpfs" | "ramfs" => Self::Tmpfs,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the kernel NFS server can export this filesystem.
    ///
    /// Unrecognized filesystems classify as incapable: the downstream stages
    /// only consume this binary answer, and guessing capable risks a doomed
    /// multi-gigabyte copy before the export fails anyway.
    #[must_use]
    pub const fn is_export_capable(&self) -> bool {
        matches!(self, Self::Ext | Self::Xfs | Self::Btrfs)
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ext => write!(f, "ext"),
            Self::Xfs => write!(f, "xfs"),
            Self::Btrfs => write!(f, "btrfs"),
            Self::Overlay => write!(f, "overlay"),
            Self::Tmpfs => write!(f, "tmpfs"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Classify the filesystem backing `path`.
///
/// No side effects; safe to call repeatedly. The result goes stale the
/// moment any later stage mutates the filesystem under `path`, so callers
/// re-inspect rather than cache across stages.
pub fn inspect(path: &Path, ops: &dyn SystemOps) -> LoopstageResult<FilesystemKind> {
    let kind = ops.filesystem_kind(path)?;
    tracing::info!(
        path = %path.display(),
        %kind,
        export_capable = kind.is_export_capable(),
        "Inspected staging volume"
    );
    Ok(kind)
}
