//! Miniconda toolchain.

use async_trait::async_trait;
use tracing::info;

use super::{run_required, Probe, Stage, StageContext};
use crate::error::{ProvisionError, Result};
use crate::host::CommandSpec;
use crate::state::StageId;

/// Installs Miniconda into the workspace when no `conda` is resolvable.
pub struct ToolchainStage;

#[async_trait]
impl Stage for ToolchainStage {
    fn id(&self) -> StageId {
        StageId::Toolchain
    }

    async fn check(&self, ctx: &StageContext<'_>) -> Result<Probe> {
        let local = ctx.config.conda_bin();
        if local.exists() {
            return Ok(Probe::Satisfied(format!("conda at {}", local.display())));
        }
        if let Some(path) = ctx.host.which("conda") {
            return Ok(Probe::Satisfied(format!("conda on PATH at {}", path.display())));
        }
        Ok(Probe::Missing("conda not found".into()))
    }

    async fn apply(&self, ctx: &StageContext<'_>) -> Result<Vec<String>> {
        let prefix = ctx.config.conda_prefix();
        let installer = tempfile::Builder::new()
            .prefix("miniconda-")
            .suffix(".sh")
            .tempfile()?;

        ctx.host
            .fetch(&ctx.config.miniconda_url, installer.path())
            .await
            .map_err(|e| {
                ProvisionError::environment(
                    self.id(),
                    format!("failed to download {}: {e:#}", ctx.config.miniconda_url),
                )
            })?;

        let mut cmd = CommandSpec::new("bash")
            .path_arg(installer.path())
            .arg("-b")
            .arg("-p")
            .path_arg(&prefix);
        if prefix.exists() {
            info!(prefix = %prefix.display(), "Repairing existing Miniconda prefix");
            cmd = cmd.arg("-u");
        }

        info!(prefix = %prefix.display(), "Installing Miniconda");
        run_required(ctx, self.id(), &cmd).await?;
        drop(installer);

        if !ctx.config.conda_bin().exists() {
            return Err(ProvisionError::environment(
                self.id(),
                format!(
                    "installer finished but {} is missing",
                    ctx.config.conda_bin().display()
                ),
            ));
        }
        Ok(Vec::new())
    }
}
