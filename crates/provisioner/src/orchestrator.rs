//! Provisioning orchestration.
//!
//! Runs the stages strictly in order, one at a time. For each stage the
//! idempotence check decides whether the action runs at all. Fatal failures
//! stop the run; best-effort failures are recorded and reported in the
//! end-of-run summary. The final step hands the process to the server.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::ProvisionConfig;
use crate::error::Result;
use crate::host::Host;
use crate::launcher;
use crate::stages::{build_stages, Criticality, Probe, Stage, StageContext};
use crate::state::{RetryConfig, RunPhase, RunReport, StageId, StageOutcome};
use crate::ui;

/// Drives a provisioning run from the first stage to the launch.
pub struct Provisioner {
    config: ProvisionConfig,
    host: Arc<dyn Host>,
    retry: RetryConfig,
    stages: Vec<Box<dyn Stage>>,
    report: RunReport,
}

impl Provisioner {
    /// Create a provisioner with the standard stage list.
    #[must_use]
    pub fn new(config: ProvisionConfig, host: Arc<dyn Host>) -> Self {
        let retry = RetryConfig::with_attempts(config.retry_attempts);
        let report = RunReport::new(&config.workspace);
        Self {
            config,
            host,
            retry,
            stages: build_stages(),
            report,
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The report of the current run.
    #[must_use]
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    fn context(&self) -> StageContext<'_> {
        StageContext {
            config: &self.config,
            host: self.host.as_ref(),
            retry: &self.retry,
        }
    }

    fn effective_criticality(&self, stage: &dyn Stage) -> Criticality {
        if self.config.strict {
            Criticality::Fatal
        } else {
            stage.criticality()
        }
    }

    /// Evaluate every stage's check without acting.
    pub async fn inspect(&self) -> Vec<(StageId, Probe)> {
        let ctx = self.context();
        let mut results = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let probe = stage
                .check(&ctx)
                .await
                .unwrap_or_else(|e| Probe::Missing(e.to_string()));
            results.push((stage.id(), probe));
        }
        results
    }

    /// Run every stage, then launch the server.
    ///
    /// On a real host a successful run never returns: the process becomes
    /// the server.
    ///
    /// # Errors
    ///
    /// Returns the first fatal stage error, or the launch error.
    pub async fn run(&mut self) -> Result<&RunReport> {
        tokio::fs::create_dir_all(&self.config.workspace).await?;
        if self.report.phase.is_terminal() {
            self.report = RunReport::new(&self.config.workspace);
        }

        ui::print_section("Provisioning");

        let stages = std::mem::take(&mut self.stages);
        let result = self.run_stages(&stages).await;
        self.stages = stages;
        result?;

        self.launch()
    }

    async fn run_stages(&mut self, stages: &[Box<dyn Stage>]) -> Result<()> {
        for stage in stages {
            let stage = stage.as_ref();
            let id = stage.id();
            ui::print_progress_step(id.step_number(), StageId::TOTAL_STAGES, id.description());
            let phase = self.advance();
            debug_assert_eq!(phase, RunPhase::Running(id));

            match self.run_stage(stage).await {
                Ok(outcome) => {
                    ui::print_stage_outcome(&outcome);
                    self.record(id, outcome);
                }
                Err(e) if self.effective_criticality(stage) == Criticality::BestEffort => {
                    warn!(stage = id.name(), error = %e, "Best-effort stage failed, continuing");
                    let outcome = StageOutcome::Skipped {
                        error: e.to_string(),
                    };
                    ui::print_stage_outcome(&outcome);
                    self.record(id, outcome);
                }
                Err(e) => {
                    error!(stage = id.name(), error = %e, "Stage failed");
                    let outcome = StageOutcome::Failed {
                        error: e.to_string(),
                    };
                    ui::print_stage_outcome(&outcome);
                    self.record(id, outcome);
                    self.transition(RunPhase::Aborted(id));
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn run_stage(&self, stage: &dyn Stage) -> Result<StageOutcome> {
        let ctx = self.context();
        match stage.check(&ctx).await? {
            Probe::Satisfied(detail) => {
                info!(stage = stage.id().name(), %detail, "Already satisfied");
                Ok(StageOutcome::Satisfied { detail })
            }
            Probe::Missing(reason) => {
                info!(stage = stage.id().name(), %reason, "Applying");
                let failures = stage.apply(&ctx).await?;
                if failures.is_empty() {
                    Ok(StageOutcome::Applied)
                } else {
                    Ok(StageOutcome::Degraded { failures })
                }
            }
        }
    }

    fn launch(&mut self) -> Result<&RunReport> {
        let id = StageId::Launch;
        ui::print_progress_step(id.step_number(), StageId::TOTAL_STAGES, id.description());
        self.advance();
        self.print_summary();

        // Nothing runs after a successful exec, so the report is final now.
        self.advance();

        if let Err(e) = launcher::launch(self.host.as_ref(), &self.config) {
            error!(error = %e, "Launch failed");
            self.record(
                id,
                StageOutcome::Failed {
                    error: e.to_string(),
                },
            );
            self.transition(RunPhase::Aborted(id));
            return Err(e);
        }
        Ok(&self.report)
    }

    /// Move to the next phase of the linear run.
    fn advance(&mut self) -> RunPhase {
        let next = self.report.phase.advance();
        self.transition(next);
        next
    }

    fn transition(&mut self, phase: RunPhase) {
        if let Err(e) = self.report.set_phase(phase) {
            warn!(error = %e, "Failed to save run report");
        }
    }

    fn record(&mut self, stage: StageId, outcome: StageOutcome) {
        if let Err(e) = self.report.record(stage, outcome) {
            warn!(error = %e, "Failed to save run report");
        }
    }

    fn print_summary(&self) {
        ui::print_section("Summary");

        let partial = self.report.partial_failures();
        if partial.is_empty() {
            ui::print_success("All stages completed");
        } else {
            ui::print_warning("Completed with failures:");
            for record in partial {
                match &record.outcome {
                    StageOutcome::Degraded { failures } => {
                        for failure in failures {
                            ui::print_list_item(&format!("{}: {failure}", record.stage.name()));
                        }
                    }
                    StageOutcome::Skipped { error } => {
                        ui::print_list_item(&format!("{}: {error}", record.stage.name()));
                    }
                    _ => {}
                }
            }
            ui::print_info("Re-run provision to retry the failed items");
        }

        ui::print_kv("Workspace", &self.config.workspace.display().to_string());
        ui::print_kv(
            "Server",
            &format!("http://{}:{}", launcher::LISTEN_ADDR, self.config.port),
        );
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;
    use crate::host::CommandOutput;
    use crate::stages::test_support::touch;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        config: ProvisionConfig,
        host: Arc<FakeHost>,
    }

    impl Harness {
        /// A workspace where every check passes.
        fn provisioned() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = ProvisionConfig::with_defaults(dir.path()).unwrap();
            config.system_packages.clear();

            touch(&config.conda_bin());
            touch(&config.python());
            touch(&config.hub_cli());
            touch(&config.requirements_file());
            touch(&config.app_dir().join("main.py"));
            std::fs::create_dir_all(config.plugin_dir()).unwrap();
            std::fs::create_dir_all(config.reference_dir()).unwrap();
            for asset in config.asset_descriptors() {
                touch(&asset.dest_path());
            }

            let host = Arc::new(FakeHost::new());
            let listing = serde_json::json!({ "envs": [config.env_prefix()] });
            host.on("env list", CommandOutput::ok(listing.to_string()));
            host.on("--dry-run", CommandOutput::ok(r#"{"install": []}"#));

            Self {
                _dir: dir,
                config,
                host,
            }
        }

        fn provisioner(&self) -> Provisioner {
            Provisioner::new(self.config.clone(), self.host.clone())
                .with_retry(RetryConfig::disabled())
        }

        fn actions(&self) -> Vec<String> {
            self.host
                .calls()
                .iter()
                .filter(|c| !c.capture)
                .map(ToString::to_string)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_satisfied_workspace_only_launches() {
        let h = Harness::provisioned();
        let mut provisioner = h.provisioner();
        let report = provisioner.run().await.unwrap();

        assert!(report.is_launched());
        assert_eq!(report.stages.len(), 9);
        assert!(report
            .stages
            .iter()
            .all(|r| matches!(r.outcome, StageOutcome::Satisfied { .. })));
        assert!(h.actions().is_empty());
        assert_eq!(h.host.execs().len(), 1);

        let saved = RunReport::load(&h.config.workspace).unwrap().unwrap();
        assert_eq!(saved.phase, RunPhase::Launched);
    }

    #[tokio::test]
    async fn test_rerun_starts_a_fresh_phase_sequence() {
        let h = Harness::provisioned();
        let mut provisioner = h.provisioner();
        provisioner.run().await.unwrap();

        let report = provisioner.run().await.unwrap();
        assert_eq!(report.phase, RunPhase::Launched);
        assert_eq!(report.stages.len(), 9);
        assert_eq!(h.host.execs().len(), 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_stops_the_run() {
        let h = Harness::provisioned();
        std::fs::remove_dir_all(h.config.app_dir()).unwrap();
        h.host.on("git clone", CommandOutput::failed(128, "repository not found"));

        let mut provisioner = h.provisioner();
        let err = provisioner.run().await.unwrap_err();

        assert_eq!(err.stage(), Some(StageId::Application));
        assert_eq!(provisioner.report().phase, RunPhase::Aborted(StageId::Application));
        assert_eq!(h.host.count("git clone"), 1);
        assert_eq!(h.host.count("--dry-run"), 0);
        assert!(h.host.execs().is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_failure_continues_to_launch() {
        let h = Harness::provisioned();
        std::fs::remove_dir_all(h.config.plugin_dir()).unwrap();
        h.host.on("git clone", CommandOutput::failed(128, "Could not resolve host"));

        let mut provisioner = h.provisioner();
        let report = provisioner.run().await.unwrap();

        assert!(matches!(
            report.outcome(StageId::Plugin),
            Some(StageOutcome::Skipped { .. })
        ));
        assert_eq!(report.partial_failures().len(), 1);
        assert!(report.is_launched());
        assert_eq!(h.host.execs().len(), 1);
    }

    #[tokio::test]
    async fn test_strict_mode_makes_best_effort_fatal() {
        let mut h = Harness::provisioned();
        h.config.strict = true;
        std::fs::remove_dir_all(h.config.reference_dir()).unwrap();
        h.host.on("git clone", CommandOutput::failed(128, "Could not resolve host"));

        let mut provisioner = h.provisioner();
        let err = provisioner.run().await.unwrap_err();
        assert_eq!(err.stage(), Some(StageId::Reference));
        assert!(h.host.execs().is_empty());
    }

    #[tokio::test]
    async fn test_degraded_assets_are_reported() {
        let h = Harness::provisioned();
        let vae = h.config.asset_descriptors()[3].dest_path();
        std::fs::remove_file(&vae).unwrap();
        h.host.on("download", CommandOutput::failed(1, "gated repo"));

        let mut provisioner = h.provisioner();
        let report = provisioner.run().await.unwrap();
        match report.outcome(StageId::Assets) {
            Some(StageOutcome::Degraded { failures }) => assert_eq!(failures.len(), 1),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(report.is_launched());
    }

    #[tokio::test]
    async fn test_launch_failure_aborts() {
        let h = Harness::provisioned();
        std::fs::remove_file(h.config.app_dir().join("main.py")).unwrap();

        let mut provisioner = h.provisioner();
        let err = provisioner.run().await.unwrap_err();
        assert_eq!(err.stage(), Some(StageId::Launch));
        assert_eq!(provisioner.report().phase, RunPhase::Aborted(StageId::Launch));
    }

    #[tokio::test]
    async fn test_inspect_runs_no_actions() {
        let h = Harness::provisioned();
        std::fs::remove_dir_all(h.config.reference_dir()).unwrap();

        let probes = h.provisioner().inspect().await;
        assert_eq!(probes.len(), 9);
        let missing: Vec<StageId> = probes
            .iter()
            .filter(|(_, p)| !p.is_satisfied())
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(missing, vec![StageId::Reference]);
        assert!(h.actions().is_empty());
    }
}
