//! Git checkouts for the application, plugin and reference repositories.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::{Criticality, Probe, Stage, StageContext};
use crate::config::{ProvisionConfig, RepoSource};
use crate::error::{ProvisionError, Result};
use crate::host::CommandSpec;
use crate::state::StageId;

type Target = fn(&ProvisionConfig) -> (RepoSource, PathBuf);

/// Clones a repository unless its directory already exists.
///
/// An existing directory is never touched: no pull, no checkout.
pub struct CloneStage {
    id: StageId,
    criticality: Criticality,
    target: Target,
}

impl CloneStage {
    /// The application repository (fatal).
    #[must_use]
    pub fn application() -> Self {
        Self {
            id: StageId::Application,
            criticality: Criticality::Fatal,
            target: |c| (c.application.clone(), c.app_dir()),
        }
    }

    /// The plugin repository (best-effort).
    #[must_use]
    pub fn plugin() -> Self {
        Self {
            id: StageId::Plugin,
            criticality: Criticality::BestEffort,
            target: |c| (c.plugin.clone(), c.plugin_dir()),
        }
    }

    /// The reference repository (best-effort).
    #[must_use]
    pub fn reference() -> Self {
        Self {
            id: StageId::Reference,
            criticality: Criticality::BestEffort,
            target: |c| (c.reference.clone(), c.reference_dir()),
        }
    }

    fn clone_command(repo: &RepoSource, dir: &std::path::Path) -> CommandSpec {
        let mut cmd = CommandSpec::new("git").arg("clone");
        if let Some(branch) = &repo.branch {
            cmd = cmd.args(["--branch", branch.as_str()]);
        }
        cmd.arg(repo.url.as_str()).path_arg(dir)
    }
}

#[async_trait]
impl Stage for CloneStage {
    fn id(&self) -> StageId {
        self.id
    }

    fn criticality(&self) -> Criticality {
        self.criticality
    }

    async fn check(&self, ctx: &StageContext<'_>) -> Result<Probe> {
        let (_, dir) = (self.target)(ctx.config);
        if dir.exists() {
            Ok(Probe::Satisfied(format!("{} exists", dir.display())))
        } else {
            Ok(Probe::Missing(format!("{} not cloned", dir.display())))
        }
    }

    async fn apply(&self, ctx: &StageContext<'_>) -> Result<Vec<String>> {
        let (repo, dir) = (self.target)(ctx.config);
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let cmd = Self::clone_command(&repo, &dir);
        info!(url = %repo.url, branch = ?repo.branch, dir = %dir.display(), "Cloning repository");

        let label = format!("git clone {}", repo.url);
        let host = ctx.host;
        let id = self.id;
        let cmd = &cmd;
        let url = repo.url.as_str();
        ctx.retry
            .run(&label, move || async move {
                match host.run(cmd).await {
                    Ok(output) if output.success => Ok(()),
                    Ok(output) => Err(ProvisionError::source_fetch(
                        id,
                        format!("git clone {url} {}", output.failure_summary()),
                    )),
                    Err(e) => Err(ProvisionError::source_fetch(id, format!("{e:#}"))),
                }
            })
            .await?;

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CommandOutput;
    use crate::stages::test_support::Fixture;
    use crate::state::RetryConfig;

    #[tokio::test]
    async fn test_existing_directory_is_untouched() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.config.app_dir()).unwrap();

        let probe = CloneStage::application().check(&fx.ctx()).await.unwrap();
        assert!(probe.is_satisfied());
        assert!(fx.host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_clone_passes_branch() {
        let fx = Fixture::new();
        CloneStage::plugin().apply(&fx.ctx()).await.unwrap();

        let calls = fx.host.calls();
        assert_eq!(calls[0].program, "git");
        assert_eq!(
            calls[0].args,
            vec![
                "clone".to_string(),
                "--branch".to_string(),
                "main".to_string(),
                "https://github.com/ltdrdata/ComfyUI-Manager.git".to_string(),
                fx.config.plugin_dir().display().to_string(),
            ]
        );
        assert!(fx.config.custom_nodes_dir().is_dir());
    }

    #[tokio::test]
    async fn test_reference_uses_remote_default_branch() {
        let fx = Fixture::new();
        CloneStage::reference().apply(&fx.ctx()).await.unwrap();
        assert_eq!(fx.host.count("--branch"), 0);
    }

    #[tokio::test]
    async fn test_clone_failure_is_source_fetch_error() {
        let fx = Fixture::new();
        fx.host
            .on("git clone", CommandOutput::failed(128, "fatal: repository not found"));

        let err = CloneStage::application().apply(&fx.ctx()).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::SourceFetch {
                stage: StageId::Application,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_is_retried() {
        let mut fx = Fixture::new();
        fx.retry = RetryConfig::with_attempts(2);
        fx.host.on("git clone", CommandOutput::failed(128, "Could not resolve host"));

        assert!(CloneStage::reference().apply(&fx.ctx()).await.is_err());
        assert_eq!(fx.host.count("git clone"), 3);
    }

    #[test]
    fn test_criticality() {
        assert_eq!(CloneStage::application().criticality(), Criticality::Fatal);
        assert_eq!(CloneStage::plugin().criticality(), Criticality::BestEffort);
        assert_eq!(CloneStage::reference().criticality(), Criticality::BestEffort);
    }
}
