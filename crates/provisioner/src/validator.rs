use std::path::{Path, PathBuf};

use anyhow::Result;
use colored::Colorize;
use sysinfo::{Disks, System};

use crate::config::ProvisionConfig;
use crate::ui;

const GIB: u64 = 1024 * 1024 * 1024;

/// Minimum RAM before a warning is shown.
pub const MIN_MEMORY_GIB: u64 = 16;

/// Minimum free space on the workspace filesystem (weights plus toolchain).
pub const MIN_DISK_GIB: u64 = 60;

/// Validates host prerequisites before provisioning.
pub struct PreflightValidator {
    requirements: Vec<Requirement>,
}

/// A single preflight check.
pub struct Requirement {
    name: String,
    check: Box<dyn Fn() -> Result<bool>>,
    hint: String,
    critical: bool,
}

impl Requirement {
    /// Build a requirement from a check closure.
    pub fn new<F>(name: &str, hint: &str, critical: bool, check: F) -> Self
    where
        F: Fn() -> Result<bool> + 'static,
    {
        Self {
            name: name.to_string(),
            check: Box::new(check),
            hint: hint.to_string(),
            critical,
        }
    }
}

impl PreflightValidator {
    /// Standard checks for a workspace.
    pub fn new(config: &ProvisionConfig) -> Self {
        let workspace = config.workspace.clone();

        let requirements = vec![
            // bash runs the Miniconda installer
            Requirement::new(
                "bash",
                "Install bash with your system package manager",
                true,
                || Ok(which::which("bash").is_ok()),
            ),
            Requirement::new(
                "NVIDIA driver (nvidia-smi)",
                "Install the NVIDIA driver; without it inference runs on CPU",
                false,
                || Ok(which::which("nvidia-smi").is_ok()),
            ),
            Requirement::new(
                "System Memory",
                &format!("At least {MIN_MEMORY_GIB}GB of RAM recommended for FLUX"),
                false,
                || {
                    let mut sys = System::new();
                    sys.refresh_memory();
                    Ok(sys.total_memory() / GIB >= MIN_MEMORY_GIB)
                },
            ),
            Requirement::new(
                "Free Disk Space",
                &format!("At least {MIN_DISK_GIB}GB free on the workspace filesystem"),
                false,
                move || {
                    let disks = Disks::new_with_refreshed_list();
                    let mounts: Vec<(PathBuf, u64)> = disks
                        .iter()
                        .map(|d| (d.mount_point().to_path_buf(), d.available_space()))
                        .collect();
                    Ok(available_for(&workspace, &mounts)
                        .map_or(true, |free| free / GIB >= MIN_DISK_GIB))
                },
            ),
        ];

        Self { requirements }
    }

    /// Validator with an explicit requirement list.
    pub fn with_requirements(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    /// Run every check and print the results.
    ///
    /// # Errors
    ///
    /// Returns an error if any critical requirement is not met.
    pub fn validate(&self) -> Result<()> {
        println!();
        let mut failures = Vec::new();

        for requirement in &self.requirements {
            if let Ok(true) = (requirement.check)() {
                ui::print_check_result(&requirement.name, true, None);
            } else {
                ui::print_check_result(&requirement.name, false, None);
                failures.push(requirement);
            }
        }

        println!();

        if failures.is_empty() {
            ui::print_success("All prerequisites met!");
        } else {
            ui::print_warning("Some prerequisites are not met:");
            println!();
            for failure in &failures {
                if failure.critical {
                    println!(
                        "  {} {} - {}",
                        "✗".red(),
                        failure.name.red(),
                        failure.hint.bright_black()
                    );
                } else {
                    println!(
                        "  {} {} - {}",
                        "⚠".yellow(),
                        failure.name.yellow(),
                        failure.hint.bright_black()
                    );
                }
            }
            println!();

            if failures.iter().any(|f| f.critical) {
                return Err(anyhow::anyhow!(
                    "Critical prerequisites not met. Please install the required tools and try again."
                ));
            }
        }

        Ok(())
    }
}

/// Free bytes on the mount that holds `path` (longest matching mount point).
fn available_for(path: &Path, mounts: &[(PathBuf, u64)]) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, free)| *free)
}
