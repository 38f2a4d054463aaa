//! Configuration for pingtest.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `PINGTEST_*` environment variables. Command-line flags are applied on
//! top by the binary. Every problem is collected so a misconfigured
//! deployment reports all missing settings at once.

pub mod env;
pub mod source;

pub use env::{ENV_PREFIX, EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default connect/read timeout for SSH and Telnet sessions.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default reconciliation poll interval.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 360;

const DEFAULT_SSH_PORT: u16 = 22;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse config file {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// How device sessions are opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// SSH to a jump host, then `telnet <host> <port>` from its shell.
    #[default]
    #[serde(alias = "ssh")]
    SshTunnel,
    /// Direct Telnet to `<host>:<port>`.
    Telnet,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" | "ssh_tunnel" | "ssh-tunnel" => Ok(Self::SshTunnel),
            "telnet" => Ok(Self::Telnet),
            other => Err(format!("unknown backend '{other}' (expected ssh or telnet)")),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SshTunnel => f.write_str("ssh"),
            Self::Telnet => f.write_str("telnet"),
        }
    }
}

/// Jump host used by the SSH tunnel backend.
#[derive(Clone, PartialEq)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub timeout: Duration,
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &crate::util::mask_secret(&self.password))
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Device login credentials, used by both backends.
#[derive(Clone, PartialEq)]
pub struct TelnetConfig {
    pub user: String,
    pub password: String,
    pub timeout: Duration,
}

impl fmt::Debug for TelnetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelnetConfig")
            .field("user", &self.user)
            .field("password", &crate::util::mask_secret(&self.password))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PingtestConfig {
    pub backend: Backend,
    /// Present whenever the backend is [`Backend::SshTunnel`].
    pub ssh: Option<SshConfig>,
    pub telnet: TelnetConfig,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    /// Where each setting came from, keyed by its dotted name.
    pub sources: Provenance,
}

/// Setting name to the layer that supplied it.
pub type Provenance = BTreeMap<&'static str, ConfigSource>;

/// On-disk TOML shape; every field optional so files can be partial.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub backend: Option<Backend>,
    pub db_path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub ssh: FileSshConfig,
    #[serde(default)]
    pub telnet: FileTelnetConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSshConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileTelnetConfig {
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Read and parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Default database location: `<data dir>/pingtest/pingtest.db`.
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("pingtest").join("pingtest.db"))
        .unwrap_or_else(|| PathBuf::from("pingtest.db"))
}

impl PingtestConfig {
    /// Load configuration from an optional TOML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_backend(path, None)
    }

    /// Like [`Self::load`], with a backend chosen on the command line taking
    /// precedence over file and environment.
    pub fn load_with_backend(
        path: Option<&Path>,
        backend: Option<Backend>,
    ) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(file, backend, &mut EnvParser::new())
    }

    /// Merge file values with environment overrides and validate.
    pub fn resolve(
        file: FileConfig,
        backend_override: Option<Backend>,
        env: &mut EnvParser,
    ) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();
        let mut sources = Provenance::new();

        let backend = match backend_override {
            Some(backend) => Sourced {
                value: backend,
                source: ConfigSource::Cli,
                var: None,
            },
            None => {
                let raw = env.get_optional_string("BACKEND");
                let from_env = raw.value.as_deref().and_then(|value| match value.parse::<Backend>() {
                    Ok(backend) => Some(backend),
                    Err(e) => {
                        problems.push(format!("{}: {e}", env.var_name("BACKEND")));
                        None
                    }
                });
                match (from_env, file.backend) {
                    (Some(backend), _) => Sourced::from_env(backend, env.var_name("BACKEND")),
                    (None, Some(backend)) => Sourced::from_file(backend),
                    (None, None) => Sourced::default_value(Backend::default()),
                }
            }
        };
        sources.insert("backend", backend.source);
        let backend = backend.value;

        let mut required = |env: &mut EnvParser,
                            sources: &mut Provenance,
                            setting: &'static str,
                            name: &str,
                            file_value: Option<String>| {
            let value = layered(env.get_optional_string(name), file_value);
            sources.insert(setting, value.source);
            if value.value.is_none() {
                problems.push(format!("{} is required", env.var_name(name)));
            }
            value.value.unwrap_or_default()
        };

        let telnet_user = required(env, &mut sources, "telnet.user", "TELNET_USER", file.telnet.user.clone());
        let telnet_password = required(
            env,
            &mut sources,
            "telnet.password",
            "TELNET_PASSWORD",
            file.telnet.password.clone(),
        );

        let ssh = if backend == Backend::SshTunnel {
            let host = required(env, &mut sources, "ssh.host", "SSH_HOST", file.ssh.host.clone());
            let user = required(env, &mut sources, "ssh.user", "SSH_USER", file.ssh.user.clone());
            let password = required(
                env,
                &mut sources,
                "ssh.password",
                "SSH_PASSWORD",
                file.ssh.password.clone(),
            );
            let port = layered(
                env.get_optional_u64_range("SSH_PORT", 1, u64::from(u16::MAX)),
                file.ssh.port.map(u64::from),
            );
            sources.insert("ssh.port", port.source);
            let timeout_secs = layered(
                env.get_optional_u64_range("SSH_TIMEOUT", 1, 3600),
                file.ssh.timeout_secs,
            );
            sources.insert("ssh.timeout", timeout_secs.source);
            Some(SshConfig {
                host,
                user,
                password,
                port: port
                    .value
                    .and_then(|p| u16::try_from(p).ok())
                    .unwrap_or(DEFAULT_SSH_PORT),
                timeout: Duration::from_secs(timeout_secs.value.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            })
        } else {
            None
        };

        let telnet_timeout = layered(
            env.get_optional_u64_range("TELNET_TIMEOUT", 1, 3600),
            file.telnet.timeout_secs,
        );
        sources.insert("telnet.timeout", telnet_timeout.source);

        let db_path = layered(env.get_optional_path("DB_PATH"), file.db_path);
        sources.insert("db_path", db_path.source);

        let poll_interval = layered(
            env.get_optional_u64_range("POLL_INTERVAL", 1, 86_400),
            file.poll_interval_secs,
        );
        sources.insert("poll_interval", poll_interval.source);

        problems.extend(env.take_errors().into_iter().map(|e| e.to_string()));
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        Ok(Self {
            backend,
            ssh,
            telnet: TelnetConfig {
                user: telnet_user,
                password: telnet_password,
                timeout: Duration::from_secs(telnet_timeout.value.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            },
            db_path: db_path.value.unwrap_or_else(default_db_path),
            poll_interval: Duration::from_secs(
                poll_interval.value.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            sources,
        })
    }

    /// Record that `setting` was overridden by a command-line flag.
    pub fn mark_cli(&mut self, setting: &'static str) {
        self.sources.insert(setting, ConfigSource::Cli);
    }
}

/// Environment value if set, otherwise the file value, otherwise unset.
fn layered<T>(env: Sourced<Option<T>>, file: Option<T>) -> Sourced<Option<T>> {
    match (env.value, file) {
        (Some(value), _) => Sourced {
            value: Some(value),
            source: env.source,
            var: env.var,
        },
        (None, Some(value)) => Sourced::from_file(Some(value)),
        (None, None) => Sourced::default_value(None),
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
