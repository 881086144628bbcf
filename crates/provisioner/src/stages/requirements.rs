//! The application's own Python dependencies.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{run_required, Probe, Stage, StageContext};
use crate::error::Result;
use crate::host::CommandSpec;
use crate::state::StageId;

/// Subset of pip's `--report` JSON.
#[derive(Debug, Deserialize)]
struct InstallReport {
    #[serde(default)]
    install: Vec<serde_json::Value>,
}

/// Installs `requirements.txt` from the application checkout.
pub struct AppRequirementsStage;

#[async_trait]
impl Stage for AppRequirementsStage {
    fn id(&self) -> StageId {
        StageId::AppRequirements
    }

    async fn check(&self, ctx: &StageContext<'_>) -> Result<Probe> {
        let requirements = ctx.config.requirements_file();
        if !requirements.exists() {
            return Ok(Probe::Missing(format!("{} not found", requirements.display())));
        }
        let python = ctx.config.python();
        if !python.exists() {
            return Ok(Probe::Missing(format!("{} not found", python.display())));
        }

        let dry_run = CommandSpec::for_path(&python)
            .args(["-m", "pip", "install", "--dry-run", "--quiet", "--report", "-", "-r"])
            .path_arg(&requirements)
            .cwd(ctx.config.app_dir())
            .capture();

        let output = match ctx.host.run(&dry_run).await {
            Ok(out) if out.success => out,
            Ok(out) => {
                debug!(error = %out.failure_summary(), "pip dry run failed");
                return Ok(Probe::Missing("requirements could not be resolved".into()));
            }
            Err(e) => return Ok(Probe::Missing(format!("pip unavailable: {e}"))),
        };

        match serde_json::from_str::<InstallReport>(output.stdout.trim()) {
            Ok(report) if report.install.is_empty() => {
                Ok(Probe::Satisfied("requirements satisfied".into()))
            }
            Ok(report) => Ok(Probe::Missing(format!(
                "{} packages to install",
                report.install.len()
            ))),
            Err(e) => {
                debug!(error = %e, "Unreadable pip report");
                Ok(Probe::Missing("unreadable pip report".into()))
            }
        }
    }

    async fn apply(&self, ctx: &StageContext<'_>) -> Result<Vec<String>> {
        info!("Installing application requirements");
        let install = CommandSpec::for_path(&ctx.config.python())
            .args(["-m", "pip", "install", "-r"])
            .path_arg(&ctx.config.requirements_file())
            .cwd(ctx.config.app_dir());
        run_required(ctx, self.id(), &install).await?;
        Ok(Vec::new())
    }
}
