//! # Loopstage
//!
//! Loopstage remediates staging volumes on device-provisioning hosts. Some
//! hosts (notably live-USB environments) root their writable layer in an
//! overlay filesystem that cannot be exported over NFS, which the downstream
//! flashing tool requires. Loopstage detects that incompatibility, provisions
//! an ext4 loopback image sized from the staging tree, migrates the tree onto
//! it with archive-preserving copy semantics, and swaps the loopback mount
//! into the original path.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//!
//! use loopstage::ops::HostOps;
//! use loopstage::pipeline::{remediate, RemediationOutcome};
//! use loopstage::plan::SizePolicy;
//!
//! # fn example() -> loopstage_common::LoopstageResult<()> {
//! let ops = HostOps::new();
//! let staging = Path::new("/home/user/nvidia/Linux_for_Tegra/rootfs");
//! let dest = Path::new("/home/user/nvidia");
//!
//! match remediate(staging, dest, &SizePolicy::default(), &ops)? {
//!     RemediationOutcome::AlreadyCapable(kind) => {
//!         println!("{kind} already supports export, nothing to do");
//!     }
//!     RemediationOutcome::Remediated { report, .. } => {
//!         println!("migrated onto {}", report.image_path.display());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod copy;
pub mod inspect;
pub mod migrate;
pub mod ops;
pub mod pipeline;
pub mod plan;
pub mod provision;

pub use inspect::FilesystemKind;
pub use pipeline::{remediate, RemediationOutcome};
pub use plan::{RemediationPlan, SizePolicy};
