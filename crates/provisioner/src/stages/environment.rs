//! Conda environment and ML framework.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{conda_program, run_required, Probe, Stage, StageContext};
use crate::error::Result;
use crate::host::CommandSpec;
use crate::state::StageId;

#[derive(Debug, Deserialize)]
struct EnvList {
    envs: Vec<PathBuf>,
}

/// Creates the pinned Python environment.
pub struct PythonEnvStage;

#[async_trait]
impl Stage for PythonEnvStage {
    fn id(&self) -> StageId {
        StageId::PythonEnv
    }

    async fn check(&self, ctx: &StageContext<'_>) -> Result<Probe> {
        let list = CommandSpec::new(conda_program(ctx))
            .args(["env", "list", "--json"])
            .capture();
        let output = match ctx.host.run(&list).await {
            Ok(out) if out.success => out,
            Ok(out) => return Ok(Probe::Missing(format!("conda env list {}", out.failure_summary()))),
            Err(e) => return Ok(Probe::Missing(format!("conda unavailable: {e}"))),
        };

        let envs: EnvList = match serde_json::from_str(&output.stdout) {
            Ok(envs) => envs,
            Err(e) => {
                debug!(error = %e, "Unreadable conda env list");
                return Ok(Probe::Missing("unreadable conda env list".into()));
            }
        };

        // Only the workspace prefix counts; later stages run its interpreter.
        let prefix = ctx.config.env_prefix();
        if envs.envs.iter().any(|env| *env == prefix) {
            Ok(Probe::Satisfied(format!("environment '{}' exists", ctx.config.env_name)))
        } else {
            Ok(Probe::Missing(format!("environment '{}' not found", ctx.config.env_name)))
        }
    }

    async fn apply(&self, ctx: &StageContext<'_>) -> Result<Vec<String>> {
        let prefix = ctx.config.env_prefix();
        info!(
            env = %ctx.config.env_name,
            python = %ctx.config.python_version,
            "Creating Python environment"
        );
        let create = CommandSpec::new(conda_program(ctx))
            .args(["create", "-y", "-p"])
            .path_arg(&prefix)
            .arg(format!("python={}", ctx.config.python_version));
        run_required(ctx, self.id(), &create).await?;
        Ok(Vec::new())
    }
}

/// Installs PyTorch for the configured hardware tag.
pub struct FrameworkStage;

impl FrameworkStage {
    const PROBE: &'static str = "import torch, torchvision, torchaudio";
}

#[async_trait]
impl Stage for FrameworkStage {
    fn id(&self) -> StageId {
        StageId::Framework
    }

    async fn check(&self, ctx: &StageContext<'_>) -> Result<Probe> {
        let python = ctx.config.python();
        if !python.exists() {
            return Ok(Probe::Missing(format!("{} not found", python.display())));
        }

        let probe = CommandSpec::for_path(&python)
            .args(["-c", Self::PROBE])
            .capture();
        match ctx.host.run(&probe).await {
            Ok(out) if out.success => Ok(Probe::Satisfied("torch importable".into())),
            Ok(_) => Ok(Probe::Missing("torch not importable".into())),
            Err(e) => Ok(Probe::Missing(format!("interpreter failed to start: {e}"))),
        }
    }

    async fn apply(&self, ctx: &StageContext<'_>) -> Result<Vec<String>> {
        info!(
            torch = %ctx.config.torch_version,
            tag = %ctx.config.cuda_tag,
            "Installing PyTorch"
        );
        let install = CommandSpec::for_path(&ctx.config.python())
            .args(["-m", "pip", "install"])
            .arg(format!("torch=={}", ctx.config.torch_version))
            .args(["torchvision", "torchaudio", "--index-url"])
            .arg(ctx.config.torch_index_url());
        run_required(ctx, self.id(), &install).await?;
        Ok(Vec::new())
    }
}
