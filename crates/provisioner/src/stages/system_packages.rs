//! System packages via apt.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{run_required, Probe, Stage, StageContext};
use crate::error::{ProvisionError, Result};
use crate::host::CommandSpec;
use crate::state::StageId;

const INSTALLED: &str = "install ok installed";

/// Ensures the configured apt packages are installed.
pub struct SystemPackagesStage;

impl SystemPackagesStage {
    /// Whether apt commands need a `sudo` prefix.
    async fn needs_sudo(ctx: &StageContext<'_>) -> bool {
        let uid = ctx
            .host
            .run(&CommandSpec::new("id").arg("-u").capture())
            .await
            .map(|out| out.stdout.trim().to_string())
            .unwrap_or_default();
        uid != "0" && ctx.host.which("sudo").is_some()
    }

    fn apt(args: &[&str], packages: &[String], sudo: bool) -> CommandSpec {
        let cmd = CommandSpec::new("apt-get").args(args.iter().copied()).args(packages.iter().cloned());
        if sudo {
            // sudo resets the environment, so the variable goes on the command line
            CommandSpec::new("sudo")
                .arg("DEBIAN_FRONTEND=noninteractive")
                .arg(cmd.program)
                .args(cmd.args)
        } else {
            cmd.env("DEBIAN_FRONTEND", "noninteractive")
        }
    }
}

#[async_trait]
impl Stage for SystemPackagesStage {
    fn id(&self) -> StageId {
        StageId::SystemPackages
    }

    async fn check(&self, ctx: &StageContext<'_>) -> Result<Probe> {
        let packages = &ctx.config.system_packages;
        if packages.is_empty() {
            return Ok(Probe::Satisfied("no system packages configured".into()));
        }

        let mut missing = Vec::new();
        for package in packages {
            let query = CommandSpec::new("dpkg-query")
                .args(["-W", "-f=${Status}", package.as_str()])
                .capture();
            match ctx.host.run(&query).await {
                Ok(out) if out.success && out.stdout.trim() == INSTALLED => {}
                Ok(_) => missing.push(package.as_str()),
                Err(e) => {
                    debug!(error = %e, "dpkg-query unavailable");
                    return Ok(Probe::Missing("cannot query installed packages".into()));
                }
            }
        }

        if missing.is_empty() {
            Ok(Probe::Satisfied(format!("{} packages installed", packages.len())))
        } else {
            Ok(Probe::Missing(format!("not installed: {}", missing.join(", "))))
        }
    }

    async fn apply(&self, ctx: &StageContext<'_>) -> Result<Vec<String>> {
        if ctx.host.which("apt-get").is_none() {
            return Err(ProvisionError::environment(
                self.id(),
                "package manager unreachable: apt-get not found",
            ));
        }

        let sudo = Self::needs_sudo(ctx).await;
        let packages = &ctx.config.system_packages;
        info!(?packages, sudo, "Installing system packages");

        run_required(ctx, self.id(), &Self::apt(&["update", "-q"], &[], sudo)).await?;
        run_required(
            ctx,
            self.id(),
            &Self::apt(&["install", "-y", "--no-install-recommends"], packages, sudo),
        )
        .await?;

        Ok(Vec::new())
    }
}
