use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use gpu_provisioner::stages::Probe;
use gpu_provisioner::{ui, Provisioner, RunReport, StageId, SystemHost};

use super::loader;

/// Show which stages are satisfied
#[derive(Args, Debug)]
pub struct StatusCommand {
    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct StageStatus {
    stage: StageId,
    satisfied: bool,
    detail: String,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    workspace: &'a Path,
    stages: Vec<StageStatus>,
    last_run: Option<RunReport>,
}

impl StatusCommand {
    pub async fn run(&self, env_file: &Path) -> Result<()> {
        let config = loader(env_file)
            .load()
            .context("Failed to load configuration")?;
        let workspace = config.workspace.clone();

        let host = Arc::new(SystemHost::new()?.quiet());
        let provisioner = Provisioner::new(config, host);

        let stages = provisioner
            .inspect()
            .await
            .into_iter()
            .map(|(stage, probe)| {
                let satisfied = probe.is_satisfied();
                let detail = match probe {
                    Probe::Satisfied(d) | Probe::Missing(d) => d,
                };
                StageStatus {
                    stage,
                    satisfied,
                    detail,
                }
            })
            .collect();
        let last_run = RunReport::load(&workspace)?;

        let report = StatusReport {
            workspace: &workspace,
            stages,
            last_run,
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            Self::print(&report);
        }
        Ok(())
    }

    fn print(report: &StatusReport<'_>) {
        ui::print_section("Provisioning Status");
        ui::print_kv("Workspace", &report.workspace.display().to_string());
        println!();

        for status in &report.stages {
            ui::print_check_result(
                &format!(
                    "[{}/{}] {}",
                    status.stage.step_number(),
                    StageId::TOTAL_STAGES,
                    status.stage.description()
                ),
                status.satisfied,
                Some(&status.detail),
            );
        }
        println!();

        match &report.last_run {
            Some(last) => {
                ui::print_kv("Last run started", &last.started_at);
                ui::print_kv("Last run phase", &format!("{:?}", last.phase));
                for record in last.partial_failures() {
                    ui::print_warning(&format!(
                        "{}: {}",
                        record.stage.name(),
                        record.outcome.label()
                    ));
                }
            }
            None => ui::print_info("No previous run recorded"),
        }
    }
}
