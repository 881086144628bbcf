//! GPU workstation provisioner library.
//!
//! Brings a fresh GPU machine to a running ComfyUI + FLUX server in one
//! idempotent, resumable pass: system packages, a Miniconda toolchain, a
//! pinned Python environment with PyTorch, the application and its plugin
//! checkouts, the model weights, and finally an exec into the server.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gpu_provisioner::{ConfigLoader, Provisioner, SystemHost};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::new().with_env(std::env::vars()).load()?;
//!     let mut provisioner = Provisioner::new(config, Arc::new(SystemHost::new()?));
//!     provisioner.run().await?;
//!     Ok(())
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow async functions that don't use await (stage checks are uniform)
#![allow(clippy::unused_async)]

pub mod config;
pub mod error;
pub mod host;
pub mod launcher;
pub mod orchestrator;
pub mod stages;
pub mod state;
pub mod ui;
pub mod validator;

// Re-export commonly used types at the crate root
pub use config::{ConfigLoader, ConfigSource, Credential, ProvisionConfig};
pub use error::ProvisionError;
pub use host::{CommandOutput, CommandSpec, Host, SystemHost};
pub use orchestrator::Provisioner;
pub use state::{RetryConfig, RunPhase, RunReport, StageId, StageOutcome};
