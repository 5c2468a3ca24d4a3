//! Bridge configuration: `.bm-bridge.yaml` loading and discovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::BmError;
use super::lifecycle::{ServerCommand, DEFAULT_HANDSHAKE_TIMEOUT};
use super::retry::{RetryPolicy, DEFAULT_RETRY_DELAYS_MS};

/// File name searched for when walking upward.
pub const CONFIG_FILE_NAME: &str = ".bm-bridge.yaml";

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "BM_BRIDGE_CONFIG";

// ─── Types ───────────────────────────────────────────────────────────────────

/// How to launch and talk to the `bm` service.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Executable to launch. Default: `bm` resolved from `PATH`.
    #[serde(default = "default_command")]
    pub command: String,

    /// Full argument list, replacing `mcp --transport stdio --project <p>`.
    #[serde(default)]
    pub args: Option<Vec<String>>,

    /// bm project every session is bound to.
    pub project: String,

    /// Where the project lives on disk, used when it has to be created.
    #[serde(default)]
    pub project_path: Option<String>,

    /// Working directory for the subprocess.
    #[serde(default)]
    pub cwd: Option<String>,

    /// Extra environment for the subprocess.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_command() -> String {
    "bm".to_string()
}

fn default_retry_delays_ms() -> Vec<u64> {
    DEFAULT_RETRY_DELAYS_MS.to_vec()
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
}

impl BridgeConfig {
    /// Minimal config for `project` with every other field defaulted.
    pub fn for_project(project: &str) -> Self {
        Self {
            command: default_command(),
            args: None,
            project: project.to_string(),
            project_path: None,
            cwd: None,
            env: HashMap::new(),
            retry_delays_ms: default_retry_delays_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), BmError> {
        if self.project.trim().is_empty() {
            return Err(config_error("project must not be empty"));
        }
        if self.command.trim().is_empty() {
            return Err(config_error("command must not be empty"));
        }
        if self.call_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(config_error("timeouts must be greater than zero"));
        }
        Ok(())
    }

    /// The subprocess invocation this config describes.
    pub fn server_command(&self) -> ServerCommand {
        let mut command = ServerCommand::bm(&self.command, &self.project);
        if let Some(args) = &self.args {
            command.args = args.clone();
        }
        command.cwd = self.cwd.as_ref().map(PathBuf::from);
        command.env = self.env.clone();
        command
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(&self.retry_delays_ms)
    }
}

fn config_error(reason: impl Into<String>) -> BmError {
    BmError::Config {
        reason: reason.into(),
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the bridge config.
///
/// `BM_BRIDGE_CONFIG` wins when it names an existing file; otherwise walks
/// upward from `start` looking for `.bm-bridge.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, BmError> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_PATH_ENV} does not name a file, searching upward");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(config_error(format!(
        "could not find {CONFIG_FILE_NAME} above {}",
        start.display()
    )))
}

/// Load, interpolate and validate a config file.
///
/// `${VAR}` and `${VAR:-default}` are substituted before parsing; a leading
/// `~` in `cwd` and `project_path` is expanded afterwards.
pub fn load_config(path: &Path) -> Result<BridgeConfig, BmError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<BridgeConfig, BmError> {
    let interpolated = interpolate_env_vars(raw);
    let mut config: BridgeConfig = serde_yaml::from_str(&interpolated)
        .map_err(|e| config_error(format!("failed to parse config: {e}")))?;

    config.cwd = config.cwd.as_deref().map(expand_tilde);
    config.project_path = config.project_path.as_deref().map(expand_tilde);
    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Substitute every `${NAME}` and `${NAME:-fallback}` reference.
///
/// Unset variables without a fallback become empty. An unterminated `${` is
/// kept verbatim, as is a bare `$NAME`.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        let (before, after) = rest.split_at(open);
        out.push_str(before);
        let body = &after[2..];
        match body.find('}') {
            Some(close) => {
                out.push_str(&lookup_reference(&body[..close]));
                rest = &body[close + 1..];
            }
            None => {
                out.push_str(after);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Value for the text between `${` and `}`.
fn lookup_reference(reference: &str) -> String {
    let (name, fallback) = match reference.split_once(":-") {
        Some((name, fallback)) => (name, Some(fallback)),
        None => (reference, None),
    };
    match std::env::var(name.trim()) {
        Ok(value) if !value.is_empty() || fallback.is_none() => value,
        _ => fallback.unwrap_or_default().to_string(),
    }
}

/// `~` and `~/...` resolve against the home directory; `~user` is left alone.
fn expand_tilde(path: &str) -> String {
    let home = || dirs::home_dir().map(|h| h.display().to_string());
    match path.strip_prefix('~') {
        Some("") => home().unwrap_or_else(|| path.to_string()),
        Some(rest) if rest.starts_with('/') => match home() {
            Some(home) => format!("{home}{rest}"),
            None => path.to_string(),
        },
        _ => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
