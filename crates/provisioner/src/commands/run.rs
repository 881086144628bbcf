use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use gpu_provisioner::validator::PreflightValidator;
use gpu_provisioner::{ui, Provisioner, SystemHost};

use super::loader;

/// Run every stage, then launch the server
#[derive(Args, Debug, Default)]
pub struct RunCommand {
    /// Skip host prerequisite checks
    #[arg(long)]
    skip_preflight: bool,
}

impl RunCommand {
    pub async fn run(&self, env_file: &Path) -> Result<()> {
        ui::print_banner();

        let config = loader(env_file)
            .load()
            .context("Failed to load configuration")?;

        if self.skip_preflight {
            ui::print_info("Skipping preflight checks");
        } else {
            ui::print_section("Preflight");
            PreflightValidator::new(&config).validate()?;
        }

        let host = Arc::new(SystemHost::new()?);
        let mut provisioner = Provisioner::new(config, host);
        if let Err(e) = provisioner.run().await {
            ui::print_error(&e.to_string());
            return Err(e.into());
        }

        // A real host never gets here after a successful launch
        Ok(())
    }
}
