//! Model weights from the hub.
//!
//! Presence of the destination file is the only integrity signal; there is
//! no checksum verification. Each asset is attempted independently and the
//! failures are returned to the orchestrator for the end-of-run summary.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{run_required, Criticality, Probe, Stage, StageContext};
use crate::config::AssetDescriptor;
use crate::error::{ProvisionError, Result};
use crate::host::CommandSpec;
use crate::state::StageId;

/// Downloads the four model assets that are not yet present.
pub struct AssetsStage;

impl AssetsStage {
    async fn ensure_hub_client(&self, ctx: &StageContext<'_>) -> Result<()> {
        if ctx.config.hub_cli().exists() {
            return Ok(());
        }
        info!("Installing hub client");
        let install = CommandSpec::for_path(&ctx.config.python())
            .args(["-m", "pip", "install", "huggingface_hub[cli]"]);
        run_required(ctx, self.id(), &install).await?;
        Ok(())
    }

    async fn login(&self, ctx: &StageContext<'_>) {
        let Some(credential) = &ctx.config.credential else {
            return;
        };
        let login = CommandSpec::for_path(&ctx.config.hub_cli())
            .args(["login", "--token"])
            .secret_arg(credential.expose());
        match ctx.host.run(&login).await {
            Ok(out) if out.success => info!("Logged in to the hub"),
            Ok(out) => warn!(error = %out.failure_summary(), "Hub login failed, continuing"),
            Err(e) => warn!(error = %e, "Hub login failed, continuing"),
        }
    }

    async fn download(ctx: &StageContext<'_>, asset: &AssetDescriptor) -> std::result::Result<(), String> {
        tokio::fs::create_dir_all(&asset.dest_dir)
            .await
            .map_err(|e| format!("cannot create {}: {e}", asset.dest_dir.display()))?;

        let cmd = CommandSpec::for_path(&ctx.config.hub_cli())
            .args(["download", asset.repo_id.as_str(), asset.filename.as_str()])
            .arg("--local-dir")
            .path_arg(&asset.dest_dir)
            .arg("--resume-download");

        let host = ctx.host;
        let cmd = &cmd;
        let label = format!("download {}/{}", asset.repo_id, asset.filename);
        ctx.retry
            .run(&label, move || async move {
                match host.run(cmd).await {
                    Ok(out) if out.success => Ok(()),
                    Ok(out) => Err(out.failure_summary()),
                    Err(e) => Err(format!("{e:#}")),
                }
            })
            .await?;

        if asset.dest_path().exists() {
            Ok(())
        } else {
            Err(format!(
                "download finished but {} is missing",
                asset.dest_path().display()
            ))
        }
    }
}

#[async_trait]
impl Stage for AssetsStage {
    fn id(&self) -> StageId {
        StageId::Assets
    }

    fn criticality(&self) -> Criticality {
        Criticality::BestEffort
    }

    async fn check(&self, ctx: &StageContext<'_>) -> Result<Probe> {
        let assets = ctx.config.asset_descriptors();
        let mut missing = Vec::new();
        for asset in &assets {
            let path = asset.dest_path();
            match std::fs::metadata(&path) {
                Ok(meta) if meta.len() == 0 => {
                    warn!(path = %path.display(), "Asset is empty, treating as present");
                }
                Ok(_) => {}
                Err(_) => missing.push(asset.filename.as_str()),
            }
        }

        if missing.is_empty() {
            Ok(Probe::Satisfied(format!("{} assets present", assets.len())))
        } else {
            Ok(Probe::Missing(format!("missing: {}", missing.join(", "))))
        }
    }

    async fn apply(&self, ctx: &StageContext<'_>) -> Result<Vec<String>> {
        let pending: Vec<AssetDescriptor> = ctx
            .config
            .asset_descriptors()
            .into_iter()
            .filter(|a| !a.dest_path().exists())
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_hub_client(ctx).await?;
        self.login(ctx).await;

        let mut failures = Vec::new();
        for asset in &pending {
            info!(kind = %asset.kind, repo = %asset.repo_id, file = %asset.filename, "Downloading asset");
            if let Err(e) = Self::download(ctx, asset).await {
                warn!(kind = %asset.kind, error = %e, "Asset download failed");
                failures.push(format!("{} ({}/{}): {e}", asset.kind, asset.repo_id, asset.filename));
            }
        }

        if ctx.config.strict && !failures.is_empty() {
            return Err(ProvisionError::AssetDownload {
                message: failures.join("; "),
            });
        }
        Ok(failures)
    }
}
