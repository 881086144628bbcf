use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use gpu_provisioner::config::lookup_key;
use gpu_provisioner::ui;

use super::loader;

/// Show the resolved configuration
#[derive(Debug)]
pub struct ConfigCommand;

impl ConfigCommand {
    pub fn run(&self, env_file: &Path) -> Result<()> {
        let resolved = loader(env_file).resolve()?;

        ui::print_section("Configuration");
        for (name, entry) in resolved.iter() {
            let secret = lookup_key(name).is_some_and(|k| k.secret);
            let value = if entry.value.is_empty() {
                "(unset)".bright_black().to_string()
            } else if secret {
                "***".to_string()
            } else {
                entry.value.clone()
            };
            println!(
                "  {:<18} {:<60} {}",
                name,
                value,
                format!("[{}]", entry.source).bright_black()
            );
        }
        println!();

        match resolved.parse() {
            Ok(_) => {
                ui::print_success("Configuration is valid");
                Ok(())
            }
            Err(e) => {
                ui::print_error(&e.to_string());
                Err(e.into())
            }
        }
    }
}
