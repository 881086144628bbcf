//! End-to-end provisioning runs against a simulated machine.
//!
//! `SimHost` interprets the commands the stages issue and mutates a small
//! model of the machine (installed packages, files in the workspace), so the
//! idempotence checks observe the effects of earlier actions exactly as they
//! would on a real box.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use gpu_provisioner::{
    CommandOutput, CommandSpec, ConfigLoader, ConfigSource, Host, ProvisionConfig, Provisioner,
    RetryConfig, RunPhase, RunReport, StageId, StageOutcome,
};
use tempfile::TempDir;

const VALID_TOKEN: &str = "hf_valid";

#[derive(Default)]
struct World {
    packages: HashSet<String>,
    torch: bool,
    requirements: bool,
}

#[derive(Default)]
struct SimHost {
    world: Mutex<World>,
    calls: Mutex<Vec<CommandSpec>>,
    fetches: Mutex<Vec<String>>,
    execs: Mutex<Vec<CommandSpec>>,
}

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"data").unwrap();
}

fn has(cmd: &CommandSpec, arg: &str) -> bool {
    cmd.args.iter().any(|a| a == arg)
}

impl SimHost {
    fn actions(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.capture)
            .cloned()
            .collect()
    }

    fn actions_matching(&self, needle: &str) -> usize {
        self.actions()
            .iter()
            .filter(|c| c.to_string().contains(needle))
            .count()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
        self.fetches.lock().unwrap().clear();
        self.execs.lock().unwrap().clear();
    }

    fn simulate(&self, cmd: &CommandSpec) -> CommandOutput {
        let mut world = self.world.lock().unwrap();
        let args = &cmd.args;
        match cmd.program_name() {
            "id" => CommandOutput::ok("0\n"),
            "dpkg-query" => {
                let package = args.last().unwrap();
                if world.packages.contains(package) {
                    CommandOutput::ok("install ok installed")
                } else {
                    CommandOutput::failed(1, format!("no packages found matching {package}"))
                }
            }
            "apt-get" => {
                if args[0] == "install" {
                    for package in args.iter().skip(1).filter(|a| !a.starts_with('-')) {
                        world.packages.insert(package.clone());
                    }
                }
                CommandOutput::ok("")
            }
            "bash" => {
                let prefix = PathBuf::from(&args[3]);
                touch(&prefix.join("bin").join("conda"));
                CommandOutput::ok("")
            }
            "conda" if args[0] == "env" => {
                let envs_dir = Path::new(&cmd.program)
                    .parent()
                    .and_then(Path::parent)
                    .unwrap()
                    .join("envs");
                let envs: Vec<String> = std::fs::read_dir(&envs_dir)
                    .map(|rd| {
                        rd.filter_map(|e| e.ok())
                            .map(|e| e.path().display().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                CommandOutput::ok(serde_json::json!({ "envs": envs }).to_string())
            }
            "conda" if args[0] == "create" => {
                touch(&PathBuf::from(&args[3]).join("bin").join("python"));
                CommandOutput::ok("")
            }
            "python" if args[0] == "-c" => {
                if world.torch {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(1, "ModuleNotFoundError: No module named 'torch'")
                }
            }
            "python" if has(cmd, "--dry-run") => {
                let report = if world.requirements {
                    serde_json::json!({ "install": [] })
                } else {
                    serde_json::json!({ "install": [{ "metadata": { "name": "einops" } }] })
                };
                CommandOutput::ok(report.to_string())
            }
            "python" if has(cmd, "-r") => {
                world.requirements = true;
                CommandOutput::ok("")
            }
            "python" if has(cmd, "huggingface_hub[cli]") => {
                touch(&Path::new(&cmd.program).with_file_name("huggingface-cli"));
                CommandOutput::ok("")
            }
            "python" if args.iter().any(|a| a.starts_with("torch==")) => {
                world.torch = true;
                CommandOutput::ok("")
            }
            "git" => {
                let dir = PathBuf::from(args.last().unwrap());
                std::fs::create_dir_all(&dir).unwrap();
                if has(cmd, "https://github.com/comfyanonymous/ComfyUI.git") {
                    touch(&dir.join("main.py"));
                    touch(&dir.join("requirements.txt"));
                }
                CommandOutput::ok("")
            }
            "huggingface-cli" if args[0] == "login" => {
                if args[2] == VALID_TOKEN {
                    CommandOutput::ok("Login successful")
                } else {
                    CommandOutput::failed(1, "Invalid user token.")
                }
            }
            "huggingface-cli" if args[0] == "download" => {
                touch(&Path::new(&args[4]).join(&args[2]));
                CommandOutput::ok("")
            }
            other => CommandOutput::failed(127, format!("{other}: command not found")),
        }
    }
}

#[async_trait]
impl Host for SimHost {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(cmd.clone());
        Ok(self.simulate(cmd))
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        (program == "apt-get").then(|| PathBuf::from("/usr/bin/apt-get"))
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        self.fetches.lock().unwrap().push(url.to_string());
        std::fs::write(dest, b"#!/bin/bash\n")?;
        Ok(12)
    }

    fn exec(&self, cmd: &CommandSpec) -> Result<()> {
        self.execs.lock().unwrap().push(cmd.clone());
        Ok(())
    }
}

fn config_for(dir: &TempDir, extra: &[(&str, &str)]) -> ProvisionConfig {
    let mut env = vec![("WORKSPACE".to_string(), dir.path().display().to_string())];
    env.extend(extra.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())));
    ConfigLoader::new().with_env(env).load().unwrap()
}

async fn provision(config: &ProvisionConfig, host: &Arc<SimHost>) -> RunReport {
    let mut provisioner =
        Provisioner::new(config.clone(), host.clone()).with_retry(RetryConfig::disabled());
    provisioner.run().await.unwrap().clone()
}

mod fresh_machine {
    use super::*;

    #[tokio::test]
    async fn test_empty_workspace_ends_with_assets_and_server_on_8188() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, &[("HF_TOKEN", VALID_TOKEN)]);
        let host = Arc::new(SimHost::default());

        let report = provision(&config, &host).await;

        assert_eq!(report.phase, RunPhase::Launched);
        for asset in config.asset_descriptors() {
            assert!(asset.dest_path().exists(), "{} missing", asset.filename);
        }
        assert_eq!(host.fetches.lock().unwrap().len(), 1);

        let execs = host.execs.lock().unwrap();
        assert_eq!(execs.len(), 1);
        let server = execs[0].to_string();
        assert!(server.contains("main.py --listen 0.0.0.0 --port 8188"));
        assert_eq!(execs[0].cwd, Some(config.app_dir()));
    }

    #[tokio::test]
    async fn test_every_stage_acts_in_order() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, &[]);
        let host = Arc::new(SimHost::default());

        let report = provision(&config, &host).await;
        let applied: Vec<StageId> = report
            .stages
            .iter()
            .filter(|r| r.outcome.did_work())
            .map(|r| r.stage)
            .collect();
        assert_eq!(applied, StageId::ALL[..9].to_vec());
    }
}

mod idempotence {
    use super::*;

    #[tokio::test]
    async fn test_second_run_issues_no_actions() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, &[("HF_TOKEN", VALID_TOKEN)]);
        let host = Arc::new(SimHost::default());

        provision(&config, &host).await;
        host.clear();
        let report = provision(&config, &host).await;

        assert!(host.actions().is_empty(), "unexpected: {:?}", host.actions());
        assert!(host.fetches.lock().unwrap().is_empty());
        assert!(report
            .stages
            .iter()
            .all(|r| matches!(r.outcome, StageOutcome::Satisfied { .. })));
        assert_eq!(host.execs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_missing_clone_only_acts_from_clone_on() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, &[]);
        let host = Arc::new(SimHost::default());

        provision(&config, &host).await;
        std::fs::remove_dir_all(config.app_dir()).unwrap();
        host.clear();

        let report = provision(&config, &host).await;

        for stage in &StageId::ALL[..4] {
            assert!(matches!(
                report.outcome(*stage),
                Some(StageOutcome::Satisfied { .. })
            ));
        }
        let actions = host.actions();
        assert!(actions[0].to_string().contains("git clone"));
        assert_eq!(host.actions_matching("apt-get"), 0);
        assert_eq!(host.actions_matching("conda"), 0);
        assert_eq!(host.actions_matching("torch=="), 0);
        assert_eq!(host.actions_matching("git clone"), 3);
        assert_eq!(host.actions_matching("huggingface-cli download"), 4);
        assert!(host.fetches.lock().unwrap().is_empty());
    }
}

mod credentials {
    use super::*;

    #[tokio::test]
    async fn test_missing_credential_still_downloads() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, &[]);
        let host = Arc::new(SimHost::default());

        let report = provision(&config, &host).await;

        assert_eq!(host.actions_matching("login"), 0);
        assert_eq!(host.actions_matching("huggingface-cli download"), 4);
        assert!(report.is_launched());
    }

    #[tokio::test]
    async fn test_invalid_credential_login_fails_and_run_continues() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, &[("HF_TOKEN", "hf_revoked")]);
        let host = Arc::new(SimHost::default());

        let report = provision(&config, &host).await;

        assert_eq!(host.actions_matching("login --token ***"), 1);
        assert_eq!(host.actions_matching("huggingface-cli download"), 4);
        assert!(matches!(
            report.outcome(StageId::Assets),
            Some(StageOutcome::Applied)
        ));
        assert!(report.is_launched());
    }

    #[tokio::test]
    async fn test_present_asset_is_never_downloaded() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, &[("HF_TOKEN", "hf_revoked")]);
        let flux = config.asset_descriptors()[0].dest_path();
        std::fs::create_dir_all(flux.parent().unwrap()).unwrap();
        std::fs::write(&flux, b"not really weights").unwrap();

        let host = Arc::new(SimHost::default());
        provision(&config, &host).await;

        assert_eq!(host.actions_matching("flux1-dev.safetensors"), 0);
        assert_eq!(host.actions_matching("huggingface-cli download"), 3);
        assert_eq!(std::fs::read(&flux).unwrap(), b"not really weights");
    }

    #[tokio::test]
    async fn test_token_never_reaches_the_report() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, &[("HF_TOKEN", VALID_TOKEN)]);
        let host = Arc::new(SimHost::default());

        provision(&config, &host).await;

        let report = std::fs::read_to_string(
            RunReport::report_file(&config.workspace),
        )
        .unwrap();
        assert!(!report.contains(VALID_TOKEN));
    }
}

mod configuration {
    use super::*;

    #[tokio::test]
    async fn test_environment_beats_file_beats_default() {
        let dir = TempDir::new().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(&env_file, "PORT=9000\nPYTHON_VERSION=3.10\n").unwrap();

        let loader = ConfigLoader::new().with_file(&env_file).with_env(vec![
            ("WORKSPACE".to_string(), dir.path().display().to_string()),
            ("PORT".to_string(), "9443".to_string()),
        ]);
        let resolved = loader.resolve().unwrap();
        assert_eq!(resolved.source("PORT"), ConfigSource::Environment);
        assert_eq!(resolved.source("PYTHON_VERSION"), ConfigSource::File);
        assert_eq!(resolved.source("CUDA_TAG"), ConfigSource::Default);

        let config = loader.load().unwrap();
        let host = Arc::new(SimHost::default());
        provision(&config, &host).await;

        let execs = host.execs.lock().unwrap();
        assert!(execs[0].to_string().contains("--port 9443"));
        assert_eq!(host.actions_matching("python=3.10"), 1);
    }
}
