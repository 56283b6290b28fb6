//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, eyre};
use loopstage_common::ByteSize;

use crate::inspect::inspect;
use crate::ops::HostOps;
use crate::pipeline::{RemediationOutcome, remediate};
use crate::plan::{SizePolicy, default_destination, plan};

/// Loopstage - Staging-Volume Remediation
#[derive(Parser)]
#[command(name = "loopstage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Pipeline commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Classify the filesystem backing a staging directory
    Inspect {
        /// Staging directory (searched in conventional locations if omitted)
        path: Option<PathBuf>,
    },

    /// Compute the loopback image plan without touching anything
    Plan {
        /// Staging directory (searched in conventional locations if omitted)
        path: Option<PathBuf>,

        /// Directory to hold the image file (default: sibling of the
        /// staging volume's parent)
        #[arg(long)]
        dest: Option<PathBuf>,

        /// Headroom on top of the measured tree size, in percent
        #[arg(long, default_value_t = 30)]
        headroom: u32,

        /// Minimum image size regardless of measured size
        #[arg(long, default_value = "6Gi")]
        min_image_size: ByteSize,

        /// Output format (table, json)
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Run the full remediation pipeline
    Remediate {
        /// Staging directory (searched in conventional locations if omitted)
        path: Option<PathBuf>,

        /// Directory to hold the image file (default: sibling of the
        /// staging volume's parent)
        #[arg(long)]
        dest: Option<PathBuf>,

        /// Headroom on top of the measured tree size, in percent
        #[arg(long, default_value_t = 30)]
        headroom: u32,

        /// Minimum image size regardless of measured size
        #[arg(long, default_value = "6Gi")]
        min_image_size: ByteSize,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Output format (table, json)
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

/// Output format for plans and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable key/value output.
    Table,
    /// Pretty-printed JSON.
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl Cli {
    /// Execute the parsed command.
    pub fn execute(self) -> Result<()> {
        let ops = HostOps::new();

        match self.command {
            Commands::Inspect { path } => {
                let path = resolve_staging(path)?;
                let kind = inspect(&path, &ops)?;
                let verdict = if kind.is_export_capable() {
                    "export-capable"
                } else {
                    "export-incapable"
                };
                println!("{}: {kind} ({verdict})", path.display());
            }

            Commands::Plan {
                path,
                dest,
                headroom,
                min_image_size,
                format,
            } => {
                let path = resolve_staging(path)?;
                let dest = dest.unwrap_or_else(|| default_destination(&path));
                let policy = SizePolicy {
                    headroom_percent: headroom,
                    min_image_bytes: min_image_size.as_bytes(),
                };
                let plan = plan(&path, &dest, &policy, &ops)?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&plan)?);
                    }
                    OutputFormat::Table => {
                        println!("staging:       {}", plan.staging_path.display());
                        println!("destination:   {}", plan.destination_parent.display());
                        println!("image:         {}", plan.image_path.display());
                        println!(
                            "image size:    {}",
                            ByteSize::bytes(plan.image_size_bytes)
                        );
                        println!(
                            "free at dest:  {}",
                            ByteSize::bytes(plan.available_bytes_at_destination)
                        );
                    }
                }
            }

            Commands::Remediate {
                path,
                dest,
                headroom,
                min_image_size,
                yes,
                format,
            } => {
                let path = resolve_staging(path)?;
                let dest = dest.unwrap_or_else(|| default_destination(&path));
                let policy = SizePolicy {
                    headroom_percent: headroom,
                    min_image_bytes: min_image_size.as_bytes(),
                };

                if !yes {
                    let prompt = format!(
                        "Migrate {} onto a loopback image under {}? The original tree is \
                         kept as a *_original backup",
                        path.display(),
                        dest.display()
                    );
                    let confirmed = dialoguer::Confirm::new()
                        .with_prompt(prompt)
                        .default(false)
                        .interact()?;
                    if !confirmed {
                        println!("aborted");
                        return Ok(());
                    }
                }

                let outcome = remediate(&path, &dest, &policy, &ops)?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&outcome)?);
                    }
                    OutputFormat::Table => match &outcome {
                        RemediationOutcome::AlreadyCapable(kind) => {
                            println!(
                                "{}: already {kind} (export-capable), nothing to do",
                                path.display()
                            );
                        }
                        RemediationOutcome::Remediated { plan, report } => {
                            println!(
                                "{} now backed by {}",
                                report.staging_path.display(),
                                plan.image_path.display()
                            );
                            println!("backup kept at {}", report.backup_path.display());
                            if report.verified {
                                println!("export probe: ok");
                            } else if let Some(warning) = &report.warning {
                                println!("export probe: FAILED ({warning})");
                                println!("the swap is complete; retry the flashing step manually");
                            }
                        }
                    },
                }
            }
        }

        Ok(())
    }
}

fn resolve_staging(path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = path {
        return Ok(path);
    }
    discover_staging().ok_or_else(|| {
        eyre!("no staging directory found in conventional SDK locations; pass a path explicitly")
    })
}

/// Search the conventional SDK install locations for a flashing staging
/// directory (`.../nvidia/nvidia_sdk/<release>/Linux_for_Tegra/rootfs`).
fn discover_staging() -> Option<PathBuf> {
    let sdk_root = dirs::home_dir()?.join("nvidia").join("nvidia_sdk");
    let entries = std::fs::read_dir(&sdk_root).ok()?;

    for entry in entries.flatten() {
        let candidate = entry.path().join("Linux_for_Tegra").join("rootfs");
        if candidate.is_dir() {
            tracing::info!(staging = %candidate.display(), "Discovered staging directory");
            return Some(candidate);
        }
    }
    None
}
