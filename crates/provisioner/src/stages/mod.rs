//! Provisioning stages.
//!
//! Each stage pairs an idempotence check with an action. The check is a
//! first-class predicate: it inspects the filesystem or installed tooling
//! and never acts. The orchestrator only calls `apply` when the check
//! reports something missing.

mod assets;
mod environment;
mod repository;
mod requirements;
mod system_packages;
mod toolchain;

use async_trait::async_trait;

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::host::{CommandOutput, CommandSpec, Host};
use crate::state::{RetryConfig, StageId};

pub use assets::AssetsStage;
pub use environment::{FrameworkStage, PythonEnvStage};
pub use repository::CloneStage;
pub use requirements::AppRequirementsStage;
pub use system_packages::SystemPackagesStage;
pub use toolchain::ToolchainStage;

/// How a stage failure affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Failure stops the run.
    Fatal,
    /// Failure is recorded and the run continues.
    BestEffort,
}

/// Result of an idempotence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Nothing to do, with a short description of what was found.
    Satisfied(String),
    /// Work is needed, with the reason.
    Missing(String),
}

impl Probe {
    /// Whether the stage can be skipped.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied(_))
    }
}

/// Everything a stage may use.
pub struct StageContext<'a> {
    /// Resolved configuration.
    pub config: &'a ProvisionConfig,
    /// Side-effect boundary.
    pub host: &'a dyn Host,
    /// Backoff policy for network-bound commands.
    pub retry: &'a RetryConfig,
}

/// A provisioning step with a check and an action.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Which stage this is.
    fn id(&self) -> StageId;

    /// Failure policy when not running in strict mode.
    fn criticality(&self) -> Criticality {
        Criticality::Fatal
    }

    /// Inspect the machine without changing it.
    async fn check(&self, ctx: &StageContext<'_>) -> Result<Probe>;

    /// Bring the machine to the state the check expects.
    ///
    /// Returns the items that failed without failing the whole stage; an
    /// empty list means complete success.
    async fn apply(&self, ctx: &StageContext<'_>) -> Result<Vec<String>>;
}

/// The ordered stage list (every stage except the launch).
#[must_use]
pub fn build_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(SystemPackagesStage),
        Box::new(ToolchainStage),
        Box::new(PythonEnvStage),
        Box::new(FrameworkStage),
        Box::new(CloneStage::application()),
        Box::new(AppRequirementsStage),
        Box::new(CloneStage::plugin()),
        Box::new(CloneStage::reference()),
        Box::new(AssetsStage),
    ]
}

/// The conda binary to use: the workspace install if present, otherwise
/// whatever is on `PATH`.
pub(crate) fn conda_program(ctx: &StageContext<'_>) -> String {
    let local = ctx.config.conda_bin();
    if local.exists() {
        return local.display().to_string();
    }
    ctx.host
        .which("conda")
        .map_or_else(|| local.display().to_string(), |p| p.display().to_string())
}

/// Run an action command and turn spawn failures and non-zero exits into
/// an environment error for `stage`.
pub(crate) async fn run_required(
    ctx: &StageContext<'_>,
    stage: StageId,
    cmd: &CommandSpec,
) -> Result<CommandOutput> {
    let output = ctx
        .host
        .run(cmd)
        .await
        .map_err(|e| ProvisionError::environment(stage, format!("{e:#}")))?;
    if output.success {
        Ok(output)
    } else {
        Err(ProvisionError::environment(
            stage,
            format!("'{cmd}' {}", output.failure_summary()),
        ))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_matches_run_order() {
        let ids: Vec<StageId> = build_stages().iter().map(|s| s.id()).collect();
        let expected: Vec<StageId> = StageId::ALL
            .iter()
            .copied()
            .filter(|s| *s != StageId::Launch)
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_only_plugin_reference_and_assets_are_best_effort() {
        let best_effort: Vec<StageId> = build_stages()
            .iter()
            .filter(|s| s.criticality() == Criticality::BestEffort)
            .map(|s| s.id())
            .collect();
        assert_eq!(
            best_effort,
            vec![StageId::Plugin, StageId::Reference, StageId::Assets]
        );
    }

    #[tokio::test]
    async fn test_run_required_maps_failures() {
        let fx = test_support::Fixture::new();
        fx.host
            .on("pip install", CommandOutput::failed(1, "No matching distribution"));
        fx.host.unspawnable("missing-tool");

        let err = run_required(&fx.ctx(), StageId::Framework, &CommandSpec::new("pip").arg("install"))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(StageId::Framework));
        assert!(err.to_string().contains("No matching distribution"));

        let err = run_required(&fx.ctx(), StageId::Toolchain, &CommandSpec::new("missing-tool"))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(StageId::Toolchain));
    }

    #[test]
    fn test_conda_program_prefers_workspace_install() {
        let fx = test_support::Fixture::with_host(
            crate::host::fake::FakeHost::new().with_program("conda"),
        );
        assert_eq!(conda_program(&fx.ctx()), "/usr/bin/conda");

        test_support::touch(&fx.config.conda_bin());
        assert_eq!(
            conda_program(&fx.ctx()),
            fx.config.conda_bin().display().to_string()
        );
    }
}
