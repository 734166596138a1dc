//! Worker settings and configuration loading.
//!
//! Supports configuration from:
//! - TOML file (default: `emberq.toml`)
//! - Environment variables with `EMBERQ__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Each worker keeps its own `Arc<Settings>` copy. A reload swaps the
//! copy at task-drain time, so a new configuration applies atomically at
//! the next loop iteration (`Fleet::queue_reload`).

use std::collections::HashMap;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Default interval between `$SYS` statistics publications, in seconds.
pub const DEFAULT_SYS_INTERVAL: u64 = 10;

/// Default interval between expired-session sweeps, in seconds.
pub const DEFAULT_SESSION_EXPIRY_INTERVAL: u64 = 30;

/// Keep-alive assumed for a connection that has not completed CONNECT yet.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;

/// Upper bound the broker imposes on negotiated keep-alive values.
pub const DEFAULT_MAX_KEEP_ALIVE: u16 = 65535;

/// Write buffer soft watermark: queueing beyond this reports backpressure.
pub const DEFAULT_WRITE_BUFFER_SOFT_LIMIT: usize = 1024 * 1024;

/// Write buffer hard cap: queueing beyond this disconnects the client.
pub const DEFAULT_WRITE_BUFFER_HARD_LIMIT: usize = 16 * 1024 * 1024;

/// Read buffer cap; a peer that outruns the parser this far is disconnected.
pub const DEFAULT_READ_BUFFER_LIMIT: usize = 1024 * 1024;

/// Expand `${NAME}` and `${NAME:-fallback}` references in file content
/// against the process environment. Names are restricted to the usual
/// shell identifier charset; an unset variable without a fallback
/// expands to the empty string. Anything that doesn't parse as a
/// reference is left untouched.
fn expand_env_refs(content: &str) -> String {
    let re = Regex::new(r"\$\{(?P<name>[A-Za-z_][A-Za-z0-9_]*)(?::-(?P<fallback>[^}]*))?\}")
        .expect("env reference pattern is valid");
    re.replace_all(content, |caps: &regex::Captures<'_>| {
        let name = caps.name("name").map_or("", |m| m.as_str());
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => caps
                .name("fallback")
                .map_or_else(String::new, |m| m.as_str().to_string()),
        }
    })
    .into_owned()
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log filter passed to the embedding binary's logger (e.g. "info").
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Worker fleet configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Number of worker threads. 0 means one per CPU.
    pub workers: usize,
    /// Seconds between `$SYS` statistics publications. 0 disables.
    pub sys_interval: u64,
    /// Seconds between expired-session sweeps. 0 disables.
    pub session_expiry_interval: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            sys_interval: DEFAULT_SYS_INTERVAL,
            session_expiry_interval: DEFAULT_SESSION_EXPIRY_INTERVAL,
        }
    }
}

/// Per-client buffer limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSettings {
    pub write_buffer_soft_limit: usize,
    pub write_buffer_hard_limit: usize,
    pub read_buffer_limit: usize,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            write_buffer_soft_limit: DEFAULT_WRITE_BUFFER_SOFT_LIMIT,
            write_buffer_hard_limit: DEFAULT_WRITE_BUFFER_HARD_LIMIT,
            read_buffer_limit: DEFAULT_READ_BUFFER_LIMIT,
        }
    }
}

/// Keep-alive related configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Keep-alive assumed before CONNECT negotiates one. Also bounds the
    /// time a connection may idle in the handshake.
    pub default_keep_alive: u16,
    /// Upper bound on negotiated keep-alive.
    pub max_keep_alive: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_keep_alive: DEFAULT_KEEP_ALIVE,
            max_keep_alive: DEFAULT_MAX_KEEP_ALIVE,
        }
    }
}

/// Auth plugin configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Hold a process-wide mutex across plugin init/deinit, for plugins
    /// with thread-unsafe initialization.
    pub serialize_init: bool,
    /// Hold a process-wide mutex across every login/ACL check. Negates
    /// worker parallelism for the plugin; last resort only.
    pub serialize_auth_checks: bool,
    /// Seconds between plugin periodic events. 0 disables.
    pub timer_period: u64,
    /// Opaque options handed to the plugin (`plugin_opt_*` in the file).
    pub options: HashMap<String, String>,
}

/// Root settings structure. The "local copy" each worker
/// holds and swaps on reload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogSettings,
    pub server: ServerSettings,
    pub limits: LimitsSettings,
    pub session: SessionSettings,
    pub plugin: PluginSettings,
}

impl Settings {
    /// Load settings from a TOML file with environment variable overrides.
    ///
    /// Environment variables use the `EMBERQ__` prefix with double
    /// underscores for nesting: `EMBERQ__SERVER__WORKERS=4`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = expand_env_refs(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("EMBERQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string (used by tests and embedders).
    pub fn parse(content: &str) -> Result<Self> {
        let substituted = expand_env_refs(content);
        let settings: Settings = toml::from_str(&substituted)
            .map_err(|e| Error::Config(format!("TOML parse error: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if self.limits.write_buffer_hard_limit < self.limits.write_buffer_soft_limit {
            return Err(Error::Config(
                "limits.write_buffer_hard_limit must be >= write_buffer_soft_limit".into(),
            ));
        }
        if self.limits.read_buffer_limit == 0 {
            return Err(Error::Config("limits.read_buffer_limit must be > 0".into()));
        }
        if self.session.default_keep_alive == 0 {
            return Err(Error::Config(
                "session.default_keep_alive must be > 0 (it bounds the CONNECT handshake)".into(),
            ));
        }
        if self.session.max_keep_alive < self.session.default_keep_alive {
            return Err(Error::Config(
                "session.max_keep_alive must be >= default_keep_alive".into(),
            ));
        }
        Ok(())
    }

    /// Number of workers to start, resolving 0 to the CPU count.
    pub fn effective_workers(&self) -> usize {
        if self.server.workers == 0 {
            num_cpus::get()
        } else {
            self.server.workers
        }
    }
}
