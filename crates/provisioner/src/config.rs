//! Provisioning configuration.
//!
//! Configuration is resolved once at startup from three layers, in
//! increasing precedence: compiled-in defaults, an optional `key=value`
//! override file, and process environment variables. The merged string map
//! is then parsed into an immutable [`ProvisionConfig`] that every stage
//! receives. Absence of a value is never an error; only a wrongly shaped
//! value is.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ProvisionError, Result};

/// Directory name of the application checkout inside the workspace.
pub const APP_DIR_NAME: &str = "ComfyUI";

/// Directory name of the Miniconda install inside the workspace.
pub const CONDA_DIR_NAME: &str = "miniconda3";

/// A recognized configuration key.
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey {
    /// Variable name, used in the override file and the environment.
    pub name: &'static str,
    /// Compiled-in default.
    pub default: &'static str,
    /// Whether the value must never be printed.
    pub secret: bool,
    /// One-line description for `provision config`.
    pub description: &'static str,
}

const fn key(name: &'static str, default: &'static str, description: &'static str) -> ConfigKey {
    ConfigKey {
        name,
        default,
        secret: false,
        description,
    }
}

/// Every key the loader understands.
///
/// `MINICONDA_URL` has an empty entry here because its default depends on
/// the host architecture; see [`default_miniconda_url`].
pub const KEYS: &[ConfigKey] = &[
    key("WORKSPACE", "/workspace", "Root directory for everything provisioned"),
    key("ENV_NAME", "comfy", "Name of the conda environment"),
    key("PYTHON_VERSION", "3.11", "Python version for the environment"),
    key("TORCH_VERSION", "2.4.1", "Pinned PyTorch version"),
    key("CUDA_TAG", "cu121", "PyTorch wheel index tag (cu121, cpu, rocm6.1, ...)"),
    key("PORT", "8188", "Port the server listens on"),
    key(
        "SYSTEM_PACKAGES",
        "git,wget,curl,libgl1,libglib2.0-0",
        "Comma-separated apt packages (empty disables the stage)",
    ),
    key("MINICONDA_URL", "", "Miniconda installer URL"),
    key(
        "COMFYUI_REPO",
        "https://github.com/comfyanonymous/ComfyUI.git",
        "Application repository",
    ),
    key("COMFYUI_BRANCH", "master", "Application branch"),
    key(
        "MANAGER_REPO",
        "https://github.com/ltdrdata/ComfyUI-Manager.git",
        "Plugin repository",
    ),
    key("MANAGER_BRANCH", "main", "Plugin branch"),
    key(
        "REFERENCE_REPO",
        "https://github.com/XLabs-AI/x-flux-comfyui.git",
        "Reference repository",
    ),
    key("REFERENCE_BRANCH", "", "Reference branch (empty: remote default)"),
    key("FLUX_REPO", "black-forest-labs/FLUX.1-dev", "Primary model repository"),
    key("FLUX_FILE", "flux1-dev.safetensors", "Primary model file"),
    key("CLIP_L_REPO", "comfyanonymous/flux_text_encoders", "CLIP-L encoder repository"),
    key("CLIP_L_FILE", "clip_l.safetensors", "CLIP-L encoder file"),
    key("T5_REPO", "comfyanonymous/flux_text_encoders", "T5 encoder repository"),
    key("T5_FILE", "t5xxl_fp16.safetensors", "T5 encoder file"),
    key("VAE_REPO", "black-forest-labs/FLUX.1-dev", "Autoencoder repository"),
    key("VAE_FILE", "ae.safetensors", "Autoencoder file"),
    ConfigKey {
        name: "HF_TOKEN",
        default: "",
        secret: true,
        description: "Hugging Face token for gated assets",
    },
    key("STRICT", "false", "Treat every failure as fatal"),
    key("RETRY_ATTEMPTS", "2", "Retries for clones and downloads"),
    key("SERVER_ARGS", "", "Extra flags appended to the server command"),
];

/// Look up a recognized key.
#[must_use]
pub fn lookup_key(name: &str) -> Option<&'static ConfigKey> {
    KEYS.iter().find(|k| k.name == name)
}

/// Default Miniconda installer URL for the running platform.
#[must_use]
pub fn default_miniconda_url() -> String {
    let platform = match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => "MacOSX-arm64",
        ("macos", _) => "MacOSX-x86_64",
        (_, "aarch64") => "Linux-aarch64",
        _ => "Linux-x86_64",
    };
    format!("https://repo.anaconda.com/miniconda/Miniconda3-latest-{platform}.sh")
}

/// Source of a configuration value (for `provision config` and logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    /// Compiled-in default.
    Default,
    /// Override file.
    File,
    /// Process environment.
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File => write!(f, "file"),
            Self::Environment => write!(f, "environment"),
        }
    }
}

/// A merged value and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedValue {
    /// Raw string value.
    pub value: String,
    /// Winning layer.
    pub source: ConfigSource,
}

/// The merged `key -> value` map, before typing.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    values: BTreeMap<String, ResolvedValue>,
}

impl ResolvedConfig {
    /// Start from the compiled-in defaults.
    #[must_use]
    pub fn defaults() -> Self {
        let values = KEYS
            .iter()
            .map(|k| {
                let value = if k.name == "MINICONDA_URL" {
                    default_miniconda_url()
                } else {
                    k.default.to_string()
                };
                (
                    k.name.to_string(),
                    ResolvedValue {
                        value,
                        source: ConfigSource::Default,
                    },
                )
            })
            .collect();
        Self { values }
    }

    /// Apply one layer. Unknown keys and empty values are ignored.
    pub fn apply<I>(&mut self, layer: I, source: ConfigSource)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in layer {
            if lookup_key(&name).is_none() {
                if source == ConfigSource::File {
                    warn!(key = %name, "Ignoring unknown key in override file");
                }
                continue;
            }
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            self.values
                .insert(name, ResolvedValue { value, source });
        }
    }

    /// Raw value of a key.
    #[must_use]
    pub fn get(&self, name: &str) -> &str {
        self.values.get(name).map_or("", |v| v.value.as_str())
    }

    /// Winning layer for a key.
    #[must_use]
    pub fn source(&self, name: &str) -> ConfigSource {
        self.values
            .get(name)
            .map_or(ConfigSource::Default, |v| v.source)
    }

    /// Iterate resolved entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolvedValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parse into a typed configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Config`] for any wrongly shaped value.
    pub fn parse(&self) -> Result<ProvisionConfig> {
        let version = pattern("PYTHON_VERSION", r"^\d+\.\d+(\.\d+)?$")?;
        let torch_version =
            pattern("TORCH_VERSION", r"^\d+\.\d+(\.\d+)?([+.-][0-9A-Za-z.]+)?$")?;
        let cuda_tag = pattern("CUDA_TAG", r"^(cu\d{2,3}|cpu|rocm\d+(\.\d+)*)$")?;
        let env_name = pattern("ENV_NAME", r"^[A-Za-z0-9_.-]+$")?;
        let repo_id = pattern("FLUX_REPO", r"^[A-Za-z0-9][\w.-]*/[\w.-]+$")?;

        let matching = |name: &str, re: &Regex, shape: &str| -> Result<String> {
            let value = self.get(name);
            if re.is_match(value) {
                Ok(value.to_string())
            } else {
                Err(ProvisionError::config(
                    name,
                    format!("expected {shape}, got '{value}'"),
                ))
            }
        };

        let port = parse_port(self.get("PORT"))?;
        let strict = parse_bool("STRICT", self.get("STRICT"))?;
        let retry_attempts = self.get("RETRY_ATTEMPTS").parse::<u32>().map_err(|_| {
            ProvisionError::config(
                "RETRY_ATTEMPTS",
                format!("expected a non-negative integer, got '{}'", self.get("RETRY_ATTEMPTS")),
            )
        })?;

        let miniconda_url = self.get("MINICONDA_URL").to_string();
        if !(miniconda_url.starts_with("https://") || miniconda_url.starts_with("http://")) {
            return Err(ProvisionError::config(
                "MINICONDA_URL",
                format!("expected an http(s) URL, got '{miniconda_url}'"),
            ));
        }

        let asset = |kind: AssetKind| -> Result<AssetSpec> {
            let (repo_key, file_key) = kind.keys();
            Ok(AssetSpec {
                kind,
                repo_id: matching(repo_key, &repo_id, "'owner/name'")?,
                filename: self.get(file_key).to_string(),
            })
        };

        let plugin = RepoSource::new(self.get("MANAGER_REPO"), self.get("MANAGER_BRANCH"));
        let reference = RepoSource::new(self.get("REFERENCE_REPO"), self.get("REFERENCE_BRANCH"));
        for (key, repo) in [("MANAGER_REPO", &plugin), ("REFERENCE_REPO", &reference)] {
            if matches!(repo.dir_name().as_str(), "" | "." | "..") {
                return Err(ProvisionError::config(
                    key,
                    format!("cannot derive a checkout directory from '{}'", repo.url),
                ));
            }
        }
        if plugin.dir_name() == reference.dir_name() {
            return Err(ProvisionError::config(
                "REFERENCE_REPO",
                format!(
                    "checks out into '{}', same as MANAGER_REPO",
                    reference.dir_name()
                ),
            ));
        }

        let credential = Some(self.get("HF_TOKEN"))
            .filter(|t| !t.is_empty())
            .map(Credential::new);

        let config = ProvisionConfig {
            workspace: PathBuf::from(self.get("WORKSPACE")),
            env_name: matching("ENV_NAME", &env_name, "a conda environment name")?,
            python_version: matching("PYTHON_VERSION", &version, "a version like 3.11")?,
            torch_version: matching("TORCH_VERSION", &torch_version, "a version like 2.4.1")?,
            cuda_tag: matching("CUDA_TAG", &cuda_tag, "cuNNN, cpu or rocmN")?,
            port,
            system_packages: split_list(self.get("SYSTEM_PACKAGES")),
            miniconda_url,
            application: RepoSource::new(self.get("COMFYUI_REPO"), self.get("COMFYUI_BRANCH")),
            plugin,
            reference,
            assets: vec![
                asset(AssetKind::Diffusion)?,
                asset(AssetKind::ClipL)?,
                asset(AssetKind::T5)?,
                asset(AssetKind::Vae)?,
            ],
            credential,
            strict,
            retry_attempts,
            server_args: self
                .get("SERVER_ARGS")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        };

        debug!(workspace = %config.workspace.display(), "Configuration parsed");
        Ok(config)
    }
}

fn pattern(key: &str, re: &str) -> Result<Regex> {
    Regex::new(re).map_err(|e| ProvisionError::config(key, e.to_string()))
}

fn parse_port(value: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ProvisionError::config(
            "PORT",
            format!("expected a port number between 1 and 65535, got '{value}'"),
        )),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ProvisionError::config(
            name,
            format!("expected true or false, got '{value}'"),
        )),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Builds a [`ProvisionConfig`] from defaults, an override file and the
/// environment.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ConfigLoader {
    /// Create a loader with only the compiled-in defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an override file. A missing file is not an error.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Use the given environment (typically `std::env::vars()`).
    #[must_use]
    pub fn with_env<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env = vars.into_iter().collect();
        self
    }

    /// Merge all layers without typing them.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Config`] if the override file exists but
    /// cannot be parsed.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let mut resolved = ResolvedConfig::defaults();

        if let Some(path) = &self.file {
            if let Some(entries) = read_override_file(path)? {
                resolved.apply(entries, ConfigSource::File);
            }
        }

        resolved.apply(self.env.iter().cloned(), ConfigSource::Environment);
        Ok(resolved)
    }

    /// Merge and parse all layers.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Config`] for a broken override file or a
    /// wrongly shaped value.
    pub fn load(&self) -> Result<ProvisionConfig> {
        self.resolve()?.parse()
    }
}

fn read_override_file(path: &Path) -> Result<Option<Vec<(String, String)>>> {
    if !path.exists() {
        debug!(path = %path.display(), "No override file");
        return Ok(None);
    }

    let file_error =
        |e: dotenvy::Error| ProvisionError::config(path.display().to_string(), e.to_string());

    let entries = dotenvy::from_path_iter(path)
        .map_err(file_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(file_error)?;

    debug!(path = %path.display(), count = entries.len(), "Loaded override file");
    Ok(Some(entries))
}

/// Secret token for the model hub. Never printed, never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for handing to the hub client.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential(***)")
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

/// A git repository to clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoSource {
    /// Remote URL.
    pub url: String,
    /// Branch, or `None` for the remote default.
    pub branch: Option<String>,
}

impl RepoSource {
    fn new(url: &str, branch: &str) -> Self {
        Self {
            url: url.to_string(),
            branch: Some(branch.to_string()).filter(|b| !b.is_empty()),
        }
    }

    /// Checkout directory name derived from the URL.
    #[must_use]
    pub fn dir_name(&self) -> String {
        self.url
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit(['/', ':'])
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// The four model asset categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// Primary diffusion model weights.
    Diffusion,
    /// CLIP-L text encoder.
    ClipL,
    /// T5-XXL text encoder.
    T5,
    /// Autoencoder.
    Vae,
}

impl AssetKind {
    /// Configuration keys for (repository, filename).
    #[must_use]
    pub fn keys(&self) -> (&'static str, &'static str) {
        match self {
            Self::Diffusion => ("FLUX_REPO", "FLUX_FILE"),
            Self::ClipL => ("CLIP_L_REPO", "CLIP_L_FILE"),
            Self::T5 => ("T5_REPO", "T5_FILE"),
            Self::Vae => ("VAE_REPO", "VAE_FILE"),
        }
    }

    /// Subdirectory of the application's `models/` directory.
    #[must_use]
    pub fn models_subdir(&self) -> &'static str {
        match self {
            Self::Diffusion => "unet",
            Self::ClipL | Self::T5 => "clip",
            Self::Vae => "vae",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Diffusion => write!(f, "diffusion model"),
            Self::ClipL => write!(f, "CLIP-L encoder"),
            Self::T5 => write!(f, "T5 encoder"),
            Self::Vae => write!(f, "VAE"),
        }
    }
}

/// Where an asset comes from on the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetSpec {
    /// Category.
    pub kind: AssetKind,
    /// Hub repository id (`owner/name`).
    pub repo_id: String,
    /// File within the repository.
    pub filename: String,
}

/// A downloadable asset and where it lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetDescriptor {
    /// Category.
    pub kind: AssetKind,
    /// Hub repository id (`owner/name`).
    pub repo_id: String,
    /// File within the repository.
    pub filename: String,
    /// Directory handed to the hub client as `--local-dir`.
    pub dest_dir: PathBuf,
}

impl AssetDescriptor {
    /// Final path of the downloaded file.
    #[must_use]
    pub fn dest_path(&self) -> PathBuf {
        self.dest_dir.join(&self.filename)
    }
}

/// Fully resolved, immutable provisioning configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionConfig {
    /// Root directory for everything provisioned.
    pub workspace: PathBuf,
    /// Conda environment name.
    pub env_name: String,
    /// Python version for the environment.
    pub python_version: String,
    /// Pinned PyTorch version.
    pub torch_version: String,
    /// Wheel index tag (e.g. "cu121").
    pub cuda_tag: String,
    /// Server port.
    pub port: u16,
    /// apt packages to ensure.
    pub system_packages: Vec<String>,
    /// Miniconda installer URL.
    pub miniconda_url: String,
    /// Application repository.
    pub application: RepoSource,
    /// Plugin repository.
    pub plugin: RepoSource,
    /// Reference repository.
    pub reference: RepoSource,
    /// The four model assets.
    pub assets: Vec<AssetSpec>,
    /// Hub token, if configured.
    #[serde(skip)]
    pub credential: Option<Credential>,
    /// Treat every failure as fatal.
    pub strict: bool,
    /// Retries for clones and downloads.
    pub retry_attempts: u32,
    /// Extra server flags.
    pub server_args: Vec<String>,
}

impl ProvisionConfig {
    /// Configuration with every default, rooted at `workspace`.
    ///
    /// # Errors
    ///
    /// Only fails if a compiled-in default is malformed.
    pub fn with_defaults(workspace: impl Into<PathBuf>) -> Result<Self> {
        let mut config = ResolvedConfig::defaults().parse()?;
        config.workspace = workspace.into();
        Ok(config)
    }

    /// Miniconda install prefix.
    #[must_use]
    pub fn conda_prefix(&self) -> PathBuf {
        self.workspace.join(CONDA_DIR_NAME)
    }

    /// `conda` binary inside the install prefix.
    #[must_use]
    pub fn conda_bin(&self) -> PathBuf {
        self.conda_prefix().join("bin").join("conda")
    }

    /// Prefix of the conda environment.
    #[must_use]
    pub fn env_prefix(&self) -> PathBuf {
        self.conda_prefix().join("envs").join(&self.env_name)
    }

    /// Python interpreter of the environment.
    #[must_use]
    pub fn python(&self) -> PathBuf {
        self.env_prefix().join("bin").join("python")
    }

    /// Hub client inside the environment.
    #[must_use]
    pub fn hub_cli(&self) -> PathBuf {
        self.env_prefix().join("bin").join("huggingface-cli")
    }

    /// PyTorch wheel index for the configured hardware tag.
    #[must_use]
    pub fn torch_index_url(&self) -> String {
        format!("https://download.pytorch.org/whl/{}", self.cuda_tag)
    }

    /// Application checkout.
    #[must_use]
    pub fn app_dir(&self) -> PathBuf {
        self.workspace.join(APP_DIR_NAME)
    }

    /// Directory holding plugin and reference checkouts.
    #[must_use]
    pub fn custom_nodes_dir(&self) -> PathBuf {
        self.app_dir().join("custom_nodes")
    }

    /// Plugin checkout.
    #[must_use]
    pub fn plugin_dir(&self) -> PathBuf {
        self.custom_nodes_dir().join(self.plugin.dir_name())
    }

    /// Reference checkout.
    #[must_use]
    pub fn reference_dir(&self) -> PathBuf {
        self.custom_nodes_dir().join(self.reference.dir_name())
    }

    /// Application requirements file.
    #[must_use]
    pub fn requirements_file(&self) -> PathBuf {
        self.app_dir().join("requirements.txt")
    }

    /// Asset descriptors with their destination directories.
    #[must_use]
    pub fn asset_descriptors(&self) -> Vec<AssetDescriptor> {
        let models = self.app_dir().join("models");
        self.assets
            .iter()
            .map(|a| AssetDescriptor {
                kind: a.kind,
                repo_id: a.repo_id.clone(),
                filename: a.filename.clone(),
                dest_dir: models.join(a.kind.models_subdir()),
            })
            .collect()
    }
}
