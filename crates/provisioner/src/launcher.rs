//! Hand-off to the long-running server.

use tracing::info;

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::host::{CommandSpec, Host};

/// Address the server binds to.
pub const LISTEN_ADDR: &str = "0.0.0.0";

/// Build the server invocation.
#[must_use]
pub fn server_command(config: &ProvisionConfig) -> CommandSpec {
    CommandSpec::for_path(&config.python())
        .arg("main.py")
        .args(["--listen", LISTEN_ADDR, "--port"])
        .arg(config.port.to_string())
        .args(["--enable-cors-header", "*", "--disable-auto-launch"])
        .args(config.server_args.iter().cloned())
        .cwd(config.app_dir())
}

/// Replace the current process with the server.
///
/// On success this never returns on a real host.
///
/// # Errors
///
/// Returns [`ProvisionError::Launch`] if the interpreter or entry point is
/// missing, or the exec itself fails.
pub fn launch(host: &dyn Host, config: &ProvisionConfig) -> Result<()> {
    let entry = config.app_dir().join("main.py");
    if !entry.exists() {
        return Err(ProvisionError::Launch {
            message: format!("{} not found", entry.display()),
        });
    }
    let python = config.python();
    if !python.exists() {
        return Err(ProvisionError::Launch {
            message: format!("{} not found", python.display()),
        });
    }

    let cmd = server_command(config);
    info!(command = %cmd, port = config.port, "Launching server");
    host.exec(&cmd).map_err(|e| ProvisionError::Launch {
        message: format!("{e:#}"),
    })
}
