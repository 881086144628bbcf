pub mod config;
pub mod run;
pub mod status;

use std::path::Path;

use gpu_provisioner::ConfigLoader;

/// Loader for the process environment plus the override file.
pub fn loader(env_file: &Path) -> ConfigLoader {
    ConfigLoader::new()
        .with_file(env_file)
        .with_env(std::env::vars())
}
