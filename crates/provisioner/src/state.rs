//! Provisioning stages, run phases and the run report.
//!
//! The filesystem and the installed tooling are the source of truth for
//! whether a stage still has work to do. The run report written here is a
//! record of what happened, for `provision status`; it is never consulted
//! by an idempotence check.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Provisioning stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    /// Installing system packages via apt.
    SystemPackages,
    /// Installing the Miniconda toolchain.
    Toolchain,
    /// Creating the Python environment.
    PythonEnv,
    /// Installing PyTorch into the environment.
    Framework,
    /// Cloning the application repository.
    Application,
    /// Installing the application's Python requirements.
    AppRequirements,
    /// Cloning the plugin repository.
    Plugin,
    /// Cloning the reference repository.
    Reference,
    /// Downloading model weights.
    Assets,
    /// Handing the process over to the server.
    Launch,
}

impl StageId {
    /// All stages in execution order.
    pub const ALL: [Self; 10] = [
        Self::SystemPackages,
        Self::Toolchain,
        Self::PythonEnv,
        Self::Framework,
        Self::Application,
        Self::AppRequirements,
        Self::Plugin,
        Self::Reference,
        Self::Assets,
        Self::Launch,
    ];

    /// Total number of stages.
    pub const TOTAL_STAGES: u8 = 10;

    /// Get the next stage in the sequence, `None` after the launch.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::SystemPackages => Some(Self::Toolchain),
            Self::Toolchain => Some(Self::PythonEnv),
            Self::PythonEnv => Some(Self::Framework),
            Self::Framework => Some(Self::Application),
            Self::Application => Some(Self::AppRequirements),
            Self::AppRequirements => Some(Self::Plugin),
            Self::Plugin => Some(Self::Reference),
            Self::Reference => Some(Self::Assets),
            Self::Assets => Some(Self::Launch),
            Self::Launch => None,
        }
    }

    /// Short machine-friendly name (matches the serialized form).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SystemPackages => "system-packages",
            Self::Toolchain => "toolchain",
            Self::PythonEnv => "python-env",
            Self::Framework => "framework",
            Self::Application => "application",
            Self::AppRequirements => "app-requirements",
            Self::Plugin => "plugin",
            Self::Reference => "reference",
            Self::Assets => "assets",
            Self::Launch => "launch",
        }
    }

    /// Get a human-readable description of the stage.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::SystemPackages => "Installing system packages",
            Self::Toolchain => "Installing Miniconda toolchain",
            Self::PythonEnv => "Creating Python environment",
            Self::Framework => "Installing ML framework",
            Self::Application => "Cloning application repository",
            Self::AppRequirements => "Installing application requirements",
            Self::Plugin => "Cloning plugin repository",
            Self::Reference => "Cloning reference repository",
            Self::Assets => "Downloading model assets",
            Self::Launch => "Launching server",
        }
    }

    /// Get the stage number for progress display.
    #[must_use]
    pub fn step_number(&self) -> u8 {
        match self {
            Self::SystemPackages => 1,
            Self::Toolchain => 2,
            Self::PythonEnv => 3,
            Self::Framework => 4,
            Self::Application => 5,
            Self::AppRequirements => 6,
            Self::Plugin => 7,
            Self::Reference => 8,
            Self::Assets => 9,
            Self::Launch => 10,
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Linear run state machine: `NotStarted -> Running(stage)... -> Launched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "stage")]
pub enum RunPhase {
    /// No stage has run yet.
    NotStarted,
    /// A stage is executing.
    Running(StageId),
    /// A fatal error stopped the run at the given stage.
    Aborted(StageId),
    /// The server owns the process. Terminal.
    Launched,
}

impl RunPhase {
    /// Transition after the current stage succeeded.
    #[must_use]
    pub fn advance(self) -> Self {
        match self {
            Self::NotStarted => Self::Running(StageId::SystemPackages),
            Self::Running(StageId::Launch) | Self::Launched => Self::Launched,
            Self::Running(stage) => stage.next().map_or(Self::Launched, Self::Running),
            Self::Aborted(stage) => Self::Aborted(stage),
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Launched | Self::Aborted(_))
    }
}

/// Result of a stage within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The idempotence check passed; nothing was done.
    Satisfied { detail: String },
    /// The action ran and succeeded.
    Applied,
    /// The action ran but some items failed (e.g. individual assets).
    Degraded { failures: Vec<String> },
    /// A best-effort stage failed; the run continued.
    Skipped { error: String },
    /// A fatal failure; the run stopped here.
    Failed { error: String },
}

impl StageOutcome {
    /// Short label for display.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Satisfied { .. } => "satisfied",
            Self::Applied => "applied",
            Self::Degraded { .. } => "degraded",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether the stage performed work.
    #[must_use]
    pub fn did_work(&self) -> bool {
        matches!(self, Self::Applied | Self::Degraded { .. })
    }
}

/// One stage's entry in the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Which stage.
    pub stage: StageId,
    /// What happened.
    pub outcome: StageOutcome,
    /// When the stage finished (RFC 3339).
    pub finished_at: String,
}

/// Report of the most recent run, persisted under the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Workspace the run targeted.
    pub workspace: PathBuf,
    /// Current phase of the run.
    pub phase: RunPhase,
    /// Per-stage results, in execution order.
    pub stages: Vec<StageRecord>,
    /// When the run started (RFC 3339).
    pub started_at: String,
    /// Timestamp of last report update.
    pub updated_at: String,
}

impl RunReport {
    /// Create a new report for a run against `workspace`.
    #[must_use]
    pub fn new(workspace: &Path) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            workspace: workspace.to_path_buf(),
            phase: RunPhase::NotStarted,
            stages: Vec::new(),
            started_at: now.clone(),
            updated_at: now,
        }
    }

    /// Get the report file path for a given workspace.
    #[must_use]
    pub fn report_file(workspace: &Path) -> PathBuf {
        workspace.join(".provision").join("last-run.json")
    }

    /// Load the last report if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(workspace: &Path) -> Result<Option<Self>> {
        let path = Self::report_file(workspace);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path).context("Failed to read run report")?;
        let report: Self = serde_json::from_str(&content).context("Failed to parse run report")?;

        info!(
            "Loaded run report: phase={:?}, stages={}",
            report.phase,
            report.stages.len()
        );
        Ok(Some(report))
    }

    /// Save the report to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self) -> Result<()> {
        self.updated_at = chrono::Utc::now().to_rfc3339();

        let path = Self::report_file(&self.workspace);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).context("Failed to create report directory")?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(&path, content).context("Failed to write run report")?;

        Ok(())
    }

    /// Move to a new phase and save.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_phase(&mut self, phase: RunPhase) -> Result<()> {
        info!("Phase: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        self.save()
    }

    /// Record a stage outcome and save.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn record(&mut self, stage: StageId, outcome: StageOutcome) -> Result<()> {
        self.stages.push(StageRecord {
            stage,
            outcome,
            finished_at: chrono::Utc::now().to_rfc3339(),
        });
        self.save()
    }

    /// Outcome recorded for a stage, if it ran.
    #[must_use]
    pub fn outcome(&self, stage: StageId) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .rev()
            .find(|r| r.stage == stage)
            .map(|r| &r.outcome)
    }

    /// Stages that did not fully succeed but let the run continue.
    #[must_use]
    pub fn partial_failures(&self) -> Vec<&StageRecord> {
        self.stages
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    StageOutcome::Degraded { .. } | StageOutcome::Skipped { .. }
                )
            })
            .collect()
    }

    /// Whether the run handed off to the server.
    #[must_use]
    pub fn is_launched(&self) -> bool {
        self.phase == RunPhase::Launched
    }
}

/// Retry configuration for network-bound operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default backoff with a specific retry count.
    #[must_use]
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// No retries at all.
    #[must_use]
    pub fn disabled() -> Self {
        Self::with_attempts(0)
    }

    /// Calculate the delay for a given attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry given the number of retries already made.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds or the retry budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the last error once no retries remain.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        error = %e,
                        delay_secs = delay.as_secs(),
                        "{label} failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
