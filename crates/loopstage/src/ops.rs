//! OS capability boundary for the remediation pipeline.
//!
//! Every stage reaches the operating system only through [`SystemOps`], so
//! the pipeline can be driven by a scripted double in tests and the host
//! backend can be audited in one place. [`HostOps`] is the Linux
//! implementation: rustix for syscalls, external commands only where the
//! kernel API has no equivalent (`mkfs.ext4`, `mount -o loop`, `exportfs`).

use std::path::{Path, PathBuf};

use loopstage_common::{LoopstageError, LoopstageResult};

use crate::inspect::FilesystemKind;

/// Host capabilities the pipeline needs.
pub trait SystemOps {
    /// Classify the filesystem backing `path` from the mount table.
    fn filesystem_kind(&self, path: &Path) -> LoopstageResult<FilesystemKind>;

    /// Bytes occupied by the directory tree at `path`, measured recursively.
    fn tree_size(&self, path: &Path) -> LoopstageResult<u64>;

    /// Bytes available on the filesystem containing `path`.
    fn free_space(&self, path: &Path) -> LoopstageResult<u64>;

    /// Create a regular file of exactly `len` bytes.
    ///
    /// Prefers fast preallocation; falls back to zero-fill when the
    /// filesystem cannot preallocate.
    fn allocate_file(&self, path: &Path, len: u64) -> LoopstageResult<()>;

    /// Format the file at `path` with an export-capable filesystem, quietly.
    fn format_image(&self, path: &Path) -> LoopstageResult<()>;

    /// Loopback-mount the image file at directory `at`.
    fn mount_image(&self, image: &Path, at: &Path) -> LoopstageResult<()>;

    /// Unmount the filesystem mounted at `at`.
    fn unmount(&self, at: &Path) -> LoopstageResult<()>;

    /// Copy a directory tree preserving permissions, ownership, symlinks,
    /// and timestamps.
    fn copy_tree(&self, src: &Path, dst: &Path) -> LoopstageResult<()>;

    /// Atomically rename a directory.
    fn rename_dir(&self, from: &Path, to: &Path) -> LoopstageResult<()>;

    /// Export `path` to localhost, then immediately revoke the export.
    ///
    /// Confirms the backing filesystem actually supports network export.
    fn export_probe(&self, path: &Path) -> LoopstageResult<()>;
}

/// [`SystemOps`] backed by the real host.
#[derive(Debug, Clone, Default)]
pub struct HostOps;

impl HostOps {
    /// Create a host backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SystemOps for HostOps {
    fn filesystem_kind(&self, path: &Path) -> LoopstageResult<FilesystemKind> {
        let resolved = std::fs::canonicalize(path)?;
        let table = read_mount_table()?;
        kind_for_path(&table, &resolved).ok_or_else(|| LoopstageError::MountTable {
            message: format!("no mount table entry contains {}", resolved.display()),
        })
    }

    fn tree_size(&self, path: &Path) -> LoopstageResult<u64> {
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(path).follow_links(false) {
            let entry = entry.map_err(|e| LoopstageError::Io(e.into()))?;
            if entry.file_type().is_file() {
                // An unreadable entry must fail the plan, not undercount it.
                let meta = entry.metadata().map_err(|e| LoopstageError::Io(e.into()))?;
                total = total.saturating_add(meta.len());
            }
        }
        Ok(total)
    }

    fn free_space(&self, path: &Path) -> LoopstageResult<u64> {
        free_space_impl(path)
    }

    fn allocate_file(&self, path: &Path, len: u64) -> LoopstageResult<()> {
        allocate_file_impl(path, len)
    }

    fn format_image(&self, path: &Path) -> LoopstageResult<()> {
        tracing::debug!(image = %path.display(), "Formatting loopback image as ext4");
        let mut cmd = std::process::Command::new("mkfs.ext4");
        cmd.arg("-q").arg("-F").arg(path);
        run_command(&mut cmd)
    }

    fn mount_image(&self, image: &Path, at: &Path) -> LoopstageResult<()> {
        tracing::debug!(
            image = %image.display(),
            target = %at.display(),
            "Loopback mounting image"
        );
        let mut cmd = std::process::Command::new("mount");
        cmd.arg("-o").arg("loop").arg(image).arg(at);
        run_command(&mut cmd)
    }

    fn unmount(&self, at: &Path) -> LoopstageResult<()> {
        unmount_impl(at)
    }

    fn copy_tree(&self, src: &Path, dst: &Path) -> LoopstageResult<()> {
        crate::copy::copy_tree(src, dst)
    }

    fn rename_dir(&self, from: &Path, to: &Path) -> LoopstageResult<()> {
        tracing::debug!(from = %from.display(), to = %to.display(), "Renaming directory");
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn export_probe(&self, path: &Path) -> LoopstageResult<()> {
        let export = format!("localhost:{}", path.display());

        tracing::debug!(export = %export, "Probing NFS export capability");
        let mut grant = std::process::Command::new("exportfs");
        grant
            .arg("-o")
            .arg("rw,no_root_squash,no_subtree_check")
            .arg(&export);
        run_command(&mut grant)?;

        // Revoke immediately; the probe only confirms the grant is possible.
        let mut revoke = std::process::Command::new("exportfs");
        revoke.arg("-u").arg(&export);
        if let Err(err) = run_command(&mut revoke) {
            tracing::warn!(export = %export, %err, "Failed to revoke probe export");
        }
        Ok(())
    }
}

/// One mount table entry, as far as classification cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// The filesystem type string (ext4, overlay, ...).
    pub fstype: String,
}

/// Parse `/proc/self/mounts` content into entries.
///
/// Mount points with whitespace arrive octal-escaped (`\040` for space);
/// unescaping keeps the longest-prefix match correct for such paths.
#[must_use]
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Classify `path` against parsed mount entries by longest-prefix match.
#[must_use]
pub fn kind_for_path(table: &[MountEntry], path: &Path) -> Option<FilesystemKind> {
    table
        .iter()
        .filter(|entry| path.starts_with(&entry.mount_point))
        .max_by_key(|entry| entry.mount_point.as_os_str().len())
        .map(|entry| FilesystemKind::from_fstype(&entry.fstype))
}

fn unescape_mount_field(field: &str) -> String {
    // Escapes are per-byte, so multi-byte UTF-8 names must be assembled at
    // the byte level before decoding.
    let mut out = Vec::with_capacity(field.len());
    let mut bytes = field.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let digits: Vec<u8> = bytes.by_ref().take(3).collect();
        let decoded = std::str::from_utf8(&digits)
            .ok()
            .and_then(|s| u8::from_str_radix(s, 8).ok());
        match decoded {
            Some(byte) => out.push(byte),
            None => {
                out.push(b'\\');
                out.extend_from_slice(&digits);
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn run_command(cmd: &mut std::process::Command) -> LoopstageResult<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(LoopstageError::CommandFailed {
            program,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn read_mount_table() -> LoopstageResult<Vec<MountEntry>> {
    let content =
        std::fs::read_to_string("/proc/self/mounts").map_err(|e| LoopstageError::MountTable {
            message: format!("failed to read /proc/self/mounts: {e}"),
        })?;
    Ok(parse_mount_table(&content))
}

#[cfg(not(target_os = "linux"))]
fn read_mount_table() -> LoopstageResult<Vec<MountEntry>> {
    Err(LoopstageError::Unsupported {
        feature: "mount table inspection".to_string(),
    })
}

#[cfg(target_os = "linux")]
fn free_space_impl(path: &Path) -> LoopstageResult<u64> {
    let stat = rustix::fs::statvfs(path).map_err(|e| LoopstageError::Io(e.into()))?;
    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
}

#[cfg(not(target_os = "linux"))]
fn free_space_impl(_path: &Path) -> LoopstageResult<u64> {
    Err(LoopstageError::Unsupported {
        feature: "free-space measurement".to_string(),
    })
}

#[cfg(target_os = "linux")]
fn allocate_file_impl(path: &Path, len: u64) -> LoopstageResult<()> {
    use rustix::fs::FallocateFlags;
    use rustix::io::Errno;

    tracing::debug!(image = %path.display(), len, "Allocating image file");

    let file = std::fs::File::create(path)?;
    match rustix::fs::fallocate(&file, FallocateFlags::empty(), 0, len) {
        Ok(()) => Ok(()),
        Err(e) if e == Errno::OPNOTSUPP || e == Errno::NOSYS || e == Errno::INVAL => {
            tracing::debug!(image = %path.display(), "fallocate unsupported, zero-filling");
            zero_fill(&file, len)
        }
        Err(e) => Err(LoopstageError::Io(e.into())),
    }
}

#[cfg(not(target_os = "linux"))]
fn allocate_file_impl(_path: &Path, _len: u64) -> LoopstageResult<()> {
    Err(LoopstageError::Unsupported {
        feature: "image allocation".to_string(),
    })
}

#[cfg(target_os = "linux")]
fn zero_fill(file: &std::fs::File, len: u64) -> LoopstageResult<()> {
    use std::io::Write;

    let buf = vec![0u8; 1024 * 1024];
    let mut writer = std::io::BufWriter::new(file);
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        writer.write_all(&buf[..chunk])?;
        remaining -= chunk as u64;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn unmount_impl(at: &Path) -> LoopstageResult<()> {
    use rustix::mount::{UnmountFlags, unmount};

    tracing::debug!(target = %at.display(), "Unmounting");
    unmount(at, UnmountFlags::empty()).map_err(|e| LoopstageError::Io(e.into()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn unmount_impl(_at: &Path) -> LoopstageResult<()> {
    Err(LoopstageError::Unsupported {
        feature: "unmount".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec 0 0
/dev/sda2 / ext4 rw,relatime 0 0
overlay /run/rootfsbase overlay rw,lowerdir=/a,upperdir=/b,workdir=/c 0 0
tmpfs /tmp tmpfs rw,nosuid,nodev 0 0
/dev/sdb1 /mnt/data xfs rw,noatime 0 0
/dev/sdb2 /mnt/with\\040space ext4 rw 0 0
";

    #[test]
    fn parse_basic_table() {
        let table = parse_mount_table(SAMPLE);
        assert_eq!(table.len(), 6);
        assert_eq!(table[1].mount_point, PathBuf::from("/"));
        assert_eq!(table[1].fstype, "ext4");
    }

    #[test]
    fn unescapes_octal_mount_points() {
        let table = parse_mount_table(SAMPLE);
        assert_eq!(table[5].mount_point, PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn longest_prefix_wins() {
        let table = parse_mount_table(SAMPLE);

        let kind = kind_for_path(&table, Path::new("/run/rootfsbase/rootfs")).unwrap();
        assert!(!kind.is_export_capable());

        let kind = kind_for_path(&table, Path::new("/mnt/data/staging")).unwrap();
        assert!(kind.is_export_capable());

        // Falls back to / when nothing longer matches.
        let kind = kind_for_path(&table, Path::new("/home/user")).unwrap();
        assert_eq!(kind, FilesystemKind::Ext);
    }

    #[test]
    fn empty_table_matches_nothing() {
        assert!(kind_for_path(&[], Path::new("/anything")).is_none());
    }

    #[test]
    fn unescapes_multibyte_mount_points() {
        // "café" escaped per-byte: the two UTF-8 bytes of 'é' arrive as
        // separate octal escapes and must reassemble into one char.
        let table = parse_mount_table("/dev/sdc1 /mnt/caf\\303\\251 ext4 rw 0 0\n");
        assert_eq!(table[0].mount_point, PathBuf::from("/mnt/café"));

        let kind = kind_for_path(&table, Path::new("/mnt/café/rootfs")).unwrap();
        assert!(kind.is_export_capable());
    }

    #[test]
    fn tree_size_fails_on_unstatable_entries() {
        use std::os::unix::fs::PermissionsExt;

        // Root ignores permission bits, so the failure cannot be provoked.
        if rustix::process::geteuid().is_root() {
            return;
        }

        let tmp = tempfile::tempdir().unwrap();
        let sealed = tmp.path().join("sealed");
        std::fs::create_dir(&sealed).unwrap();
        std::fs::write(sealed.join("hidden.bin"), b"x").unwrap();
        // Readable but not traversable: names list, stat fails. The
        // measurement must propagate that instead of counting zero bytes.
        std::fs::set_permissions(&sealed, std::fs::Permissions::from_mode(0o444)).unwrap();

        let result = HostOps::new().tree_size(tmp.path());

        std::fs::set_permissions(&sealed, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(result.is_err());
    }
}
