//! The boundary between provisioning logic and the machine.
//!
//! Every external effect a stage has goes through [`Host`]: spawning and
//! awaiting a subprocess, resolving a program on `PATH`, downloading a file,
//! and replacing the current process. [`SystemHost`] is the real
//! implementation; tests substitute a scripted one.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// A subprocess invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Capture stdout/stderr instead of streaming them to the terminal.
    pub capture: bool,
    secret_args: Vec<usize>,
}

impl CommandSpec {
    /// Start building an invocation of `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Invoke a program by absolute path.
    pub fn for_path(program: &Path) -> Self {
        Self::new(program.display().to_string())
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append a path argument.
    #[must_use]
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    /// Append an argument that must never appear in logs.
    #[must_use]
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run the child in `dir`.
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Capture output (used by probes).
    #[must_use]
    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Program name without its directory.
    #[must_use]
    pub fn program_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }

    /// Arguments with secrets replaced by `***`.
    #[must_use]
    pub fn redacted_args(&self) -> Vec<&str> {
        self.args
            .iter()
            .enumerate()
            .map(|(i, a)| {
                if self.secret_args.contains(&i) {
                    "***"
                } else {
                    a.as_str()
                }
            })
            .collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.redacted_args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// What a finished subprocess produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the child exited with status 0.
    pub success: bool,
    /// Exit code, if the child exited normally.
    pub code: Option<i32>,
    /// Captured stdout (empty unless captured).
    pub stdout: String,
    /// Captured stderr (empty unless captured).
    pub stderr: String,
}

impl CommandOutput {
    /// A successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Short human description of a failure.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        let status = self
            .code
            .map_or_else(|| "was terminated by a signal".to_string(), |c| format!("exited with status {c}"));
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            format!("{status}: {}", tail.join(" | "))
        }
    }
}

/// Side effects available to stages.
#[async_trait]
pub trait Host: Send + Sync {
    /// Spawn `cmd` and wait for it.
    ///
    /// A non-zero exit is reported through [`CommandOutput::success`]; an
    /// `Err` means the program could not be started at all.
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Resolve a program on `PATH`.
    fn which(&self, program: &str) -> Option<PathBuf>;

    /// Download `url` to `dest`, returning the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;

    /// Replace the current process with `cmd`. Only returns on failure.
    fn exec(&self, cmd: &CommandSpec) -> Result<()>;
}

/// [`Host`] backed by the real operating system.
#[derive(Debug, Clone)]
pub struct SystemHost {
    client: reqwest::Client,
    show_progress: bool,
}

impl SystemHost {
    /// Create a host with a default HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gpu-provisioner/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            show_progress: true,
        })
    }

    /// Disable download progress bars.
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    fn progress_bar(&self, total: Option<u64>) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        match total {
            Some(len) => {
                let bar = ProgressBar::new(len);
                if let Ok(style) = ProgressStyle::with_template(
                    "  {spinner:.cyan} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                ) {
                    bar.set_style(style.progress_chars("=> "));
                }
                bar
            }
            None => ProgressBar::new_spinner(),
        }
    }
}

#[async_trait]
impl Host for SystemHost {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %cmd, "Running command");

        let mut command = tokio::process::Command::new(&cmd.program);
        command.args(&cmd.args).kill_on_drop(true);
        for (key, value) in &cmd.env {
            command.env(key, value);
        }
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }

        if cmd.capture {
            let output = command
                .stdin(Stdio::null())
                .output()
                .await
                .with_context(|| format!("Failed to run '{}'", cmd.program_name()))?;
            Ok(CommandOutput {
                success: output.status.success(),
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        } else {
            let status = command
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .await
                .with_context(|| format!("Failed to run '{}'", cmd.program_name()))?;
            Ok(CommandOutput {
                success: status.success(),
                code: status.code(),
                ..CommandOutput::default()
            })
        }
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        info!(url, dest = %dest.display(), "Downloading");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {url}"))?
            .error_for_status()
            .with_context(|| format!("Download of {url} was refused"))?;

        let bar = self.progress_bar(response.content_length());
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Download of {url} was interrupted"))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            bar.set_position(written);
        }
        file.flush().await?;
        bar.finish_and_clear();

        debug!(bytes = written, "Download complete");
        Ok(written)
    }

    #[cfg(unix)]
    fn exec(&self, cmd: &CommandSpec) -> Result<()> {
        use std::os::unix::process::CommandExt;

        let mut command = std::process::Command::new(&cmd.program);
        command.args(&cmd.args).envs(cmd.env.iter().cloned());
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }

        // exec only returns on failure
        let err = command.exec();
        Err(err).with_context(|| format!("Failed to exec '{cmd}'"))
    }

    #[cfg(not(unix))]
    fn exec(&self, cmd: &CommandSpec) -> Result<()> {
        let mut command = std::process::Command::new(&cmd.program);
        command.args(&cmd.args).envs(cmd.env.iter().cloned());
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }

        let status = command
            .status()
            .with_context(|| format!("Failed to start '{cmd}'"))?;
        std::process::exit(status.code().unwrap_or(1));
    }
}
