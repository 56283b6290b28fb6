//! Archive-preserving directory copy.
//!
//! The copied tree becomes the operational root filesystem for the device
//! being provisioned, so permissions, ownership, symlink targets, and
//! timestamps must all survive the copy. Ownership is restored only when
//! running as root; everything else is restored unconditionally.

use std::path::Path;

use loopstage_common::{LoopstageError, LoopstageResult};
use walkdir::WalkDir;

/// Copy the tree at `src` into `dst`, preserving metadata.
///
/// `dst` may already exist (it is typically a fresh mount point). Symlinks
/// are recreated, never followed.
pub fn copy_tree(src: &Path, dst: &Path) -> LoopstageResult<()> {
    tracing::debug!(src = %src.display(), dst = %dst.display(), "Copying tree");

    let mut entries = 0u64;
    let mut dirs = Vec::new();
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| LoopstageError::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| LoopstageError::Config {
                message: format!("walked outside copy root: {e}"),
            })?;
        let target = dst.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            dirs.push((entry.path().to_path_buf(), target));
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            recreate_symlink(&link, &target)?;
            preserve_metadata(entry.path(), &target, true)?;
        } else {
            // FIFOs, sockets, and device nodes must be recreated as nodes:
            // reading a FIFO with no writer blocks forever, and reading a
            // device yields its stream instead of the node.
            match recreate_special(entry.path(), &target, &file_type)? {
                SpecialCopy::Regular => {
                    std::fs::copy(entry.path(), &target)?;
                    preserve_metadata(entry.path(), &target, false)?;
                }
                SpecialCopy::Created => {
                    preserve_metadata(entry.path(), &target, false)?;
                }
                SpecialCopy::Skipped => {}
            }
        }
        entries += 1;
    }

    // Writing children updates the parent directory's mtime, so directory
    // metadata is restored bottom-up after the tree is in place.
    for (source, target) in dirs.iter().rev() {
        preserve_metadata(source, target, false)?;
    }

    tracing::info!(src = %src.display(), dst = %dst.display(), entries, "Tree copied");
    Ok(())
}

/// How a non-directory, non-symlink entry was handled.
enum SpecialCopy {
    /// A regular file; the caller copies the contents.
    Regular,
    /// A special node was recreated at the target.
    Created,
    /// A device node was skipped because recreating it requires root.
    Skipped,
}

#[cfg(unix)]
fn recreate_special(
    source: &Path,
    target: &Path,
    file_type: &std::fs::FileType,
) -> LoopstageResult<SpecialCopy> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    use rustix::fs::{CWD, FileType as NodeType, Mode, mknodat};

    let node_type = if file_type.is_fifo() {
        NodeType::Fifo
    } else if file_type.is_socket() {
        NodeType::Socket
    } else if file_type.is_char_device() {
        NodeType::CharacterDevice
    } else if file_type.is_block_device() {
        NodeType::BlockDevice
    } else {
        return Ok(SpecialCopy::Regular);
    };

    let is_device = matches!(node_type, NodeType::CharacterDevice | NodeType::BlockDevice);
    if is_device && !rustix::process::geteuid().is_root() {
        tracing::warn!(node = %source.display(), "Skipping device node, recreating it requires root");
        return Ok(SpecialCopy::Skipped);
    }

    let meta = source.symlink_metadata()?;
    if target.symlink_metadata().is_ok() {
        std::fs::remove_file(target)?;
    }
    mknodat(
        CWD,
        target,
        node_type,
        Mode::from_bits_truncate(meta.mode()),
        meta.rdev(),
    )
    .map_err(|e| LoopstageError::Io(e.into()))?;
    Ok(SpecialCopy::Created)
}

#[cfg(not(unix))]
fn recreate_special(
    _source: &Path,
    _target: &Path,
    _file_type: &std::fs::FileType,
) -> LoopstageResult<SpecialCopy> {
    Ok(SpecialCopy::Regular)
}

#[cfg(unix)]
fn recreate_symlink(link: &Path, target: &Path) -> LoopstageResult<()> {
    if target.symlink_metadata().is_ok() {
        std::fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn recreate_symlink(_link: &Path, _target: &Path) -> LoopstageResult<()> {
    Err(LoopstageError::Unsupported {
        feature: "symlink recreation".to_string(),
    })
}

#[cfg(unix)]
fn preserve_metadata(source: &Path, target: &Path, is_symlink: bool) -> LoopstageResult<()> {
    use std::os::unix::fs::MetadataExt;

    use rustix::fs::{AtFlags, CWD, Timespec, Timestamps, utimensat};

    let meta = source.symlink_metadata()?;

    // Mode bits on a symlink are meaningless; skip to avoid following it.
    if !is_symlink {
        std::fs::set_permissions(target, meta.permissions())?;
    }

    if rustix::process::geteuid().is_root() {
        rustix::fs::chownat(
            CWD,
            target,
            Some(rustix::process::Uid::from_raw(meta.uid())),
            Some(rustix::process::Gid::from_raw(meta.gid())),
            AtFlags::SYMLINK_NOFOLLOW,
        )
        .map_err(|e| LoopstageError::Io(e.into()))?;
    }

    let times = Timestamps {
        last_access: Timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        last_modification: Timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    };
    utimensat(CWD, target, &times, AtFlags::SYMLINK_NOFOLLOW)
        .map_err(|e| LoopstageError::Io(e.into()))?;

    Ok(())
}

#[cfg(not(unix))]
fn preserve_metadata(_source: &Path, _target: &Path, _is_symlink: bool) -> LoopstageResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    #[test]
    fn copies_files_and_directories() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(src.join("nested/deeper")).unwrap();
        fs::write(src.join("top.txt"), b"top").unwrap();
        fs::write(src.join("nested/deeper/leaf.txt"), b"leaf").unwrap();

        copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("top.txt")).unwrap(), b"top");
        assert_eq!(fs::read(dst.join("nested/deeper/leaf.txt")).unwrap(), b"leaf");
    }

    #[test]
    fn preserves_permission_bits() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        let script = src.join("run.sh");
        fs::write(&script, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o751)).unwrap();

        copy_tree(&src, &dst).unwrap();

        let mode = dst.join("run.sh").metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o751);
    }

    #[test]
    fn preserves_symlink_targets_without_following() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("real.txt"), b"real").unwrap();
        std::os::unix::fs::symlink("real.txt", src.join("alias")).unwrap();
        std::os::unix::fs::symlink("/nonexistent/target", src.join("dangling")).unwrap();

        copy_tree(&src, &dst).unwrap();

        assert_eq!(
            fs::read_link(dst.join("alias")).unwrap(),
            Path::new("real.txt")
        );
        assert_eq!(
            fs::read_link(dst.join("dangling")).unwrap(),
            Path::new("/nonexistent/target")
        );
    }

    #[test]
    fn preserves_modification_times() {
        use std::os::unix::fs::MetadataExt;

        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        let file = src.join("dated.txt");
        fs::write(&file, b"dated").unwrap();

        // Push the mtime well into the past so drift cannot mask a failure.
        let past = rustix::fs::Timestamps {
            last_access: rustix::fs::Timespec {
                tv_sec: 1_500_000_000,
                tv_nsec: 0,
            },
            last_modification: rustix::fs::Timespec {
                tv_sec: 1_400_000_000,
                tv_nsec: 0,
            },
        };
        rustix::fs::utimensat(
            rustix::fs::CWD,
            &file,
            &past,
            rustix::fs::AtFlags::empty(),
        )
        .unwrap();

        copy_tree(&src, &dst).unwrap();

        let copied = dst.join("dated.txt").metadata().unwrap();
        assert_eq!(copied.mtime(), 1_400_000_000);
    }

    #[test]
    fn recreates_fifo_nodes_without_reading_them() {
        use std::os::unix::fs::FileTypeExt;

        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(src.join("run")).unwrap();
        fs::write(src.join("run/pid"), b"1").unwrap();
        // A FIFO with no writer blocks any reader, so the copy must
        // recreate the node rather than open it.
        rustix::fs::mknodat(
            rustix::fs::CWD,
            src.join("run/queue"),
            rustix::fs::FileType::Fifo,
            rustix::fs::Mode::from_bits_truncate(0o644),
            0,
        )
        .unwrap();

        copy_tree(&src, &dst).unwrap();

        let copied = dst.join("run/queue").symlink_metadata().unwrap();
        assert!(copied.file_type().is_fifo());
        assert_eq!(fs::read(dst.join("run/pid")).unwrap(), b"1");
    }

    #[test]
    fn copy_into_existing_destination() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();

        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"a");
    }
}
