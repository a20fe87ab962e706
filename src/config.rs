use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::VmctlError;
use crate::paths;

/// One hypervisor the inventory is fetched from and sessions connect to.
///
/// Authentication is carried by the URI itself (`qemu+ssh://user@host/system`
/// uses the ssh agent, `qemu+tls://` uses the client certificates, ...).
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct EndpointConfig {
    pub name: String,
    pub uri: String,
    /// Grouping label written to the inventory; defaults to the endpoint name.
    #[facet(default)]
    pub group: String,
}

impl EndpointConfig {
    pub fn group(&self) -> &str {
        if self.group.is_empty() {
            &self.name
        } else {
            &self.group
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SessionConfig {
    #[facet(default = 30)]
    pub open_attempts: u32,
    #[facet(default = 1000)]
    pub open_interval_ms: u64,
    #[facet(default = 15)]
    pub command_timeout_s: u64,
    #[facet(default = 600)]
    pub long_command_timeout_s: u64,
    #[facet(default = 2000)]
    pub close_grace_ms: u64,
    /// Worker binary; defaults to `vmctl-worker` next to the running executable.
    pub worker_path: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_attempts: 30,
            open_interval_ms: 1000,
            command_timeout_s: 15,
            long_command_timeout_s: 600,
            close_grace_ms: 2000,
            worker_path: None,
        }
    }
}

impl SessionConfig {
    pub fn open_interval(&self) -> Duration {
        Duration::from_millis(self.open_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_s)
    }

    pub fn long_command_timeout(&self) -> Duration {
        Duration::from_secs(self.long_command_timeout_s)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct CacheConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[facet(default)]
    pub session: SessionConfig,
    #[facet(default)]
    pub cache: CacheConfig,
}

/// Parsed config plus where it came from.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// File the config was read from; `None` when running on defaults.
    pub config_path: Option<PathBuf>,
    pub config: Config,
}

impl SystemConfig {
    pub fn cache_path(&self) -> PathBuf {
        match &self.config.cache.path {
            Some(p) => PathBuf::from(p),
            None => paths::inventory_path(),
        }
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.config.endpoints.iter().find(|e| e.name == name)
    }

    pub fn worker_path(&self) -> PathBuf {
        match &self.config.session.worker_path {
            Some(p) => PathBuf::from(p),
            None => paths::default_worker_path(),
        }
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), VmctlError> {
    let mut names = HashSet::new();
    for (idx, ep) in config.endpoints.iter().enumerate() {
        let label = format!("endpoints[{idx}]");
        if ep.name.trim().is_empty() {
            return Err(VmctlError::Validation {
                message: format!("{label}: name must not be empty"),
            });
        }
        if ep.name.contains('|') || ep.group.contains('|') {
            return Err(VmctlError::Validation {
                message: format!("{label}: name and group must not contain '|'"),
            });
        }
        if ep.uri.trim().is_empty() {
            return Err(VmctlError::Validation {
                message: format!("{label}: uri must not be empty"),
            });
        }
        if !names.insert(ep.name.as_str()) {
            return Err(VmctlError::Validation {
                message: format!("duplicate endpoint name '{}'", ep.name),
            });
        }
    }

    let s = &config.session;
    if s.open_attempts < 1 {
        return Err(VmctlError::Validation {
            message: "session.open_attempts must be at least 1".into(),
        });
    }
    for (field, value) in [
        ("open_interval_ms", s.open_interval_ms),
        ("command_timeout_s", s.command_timeout_s),
        ("long_command_timeout_s", s.long_command_timeout_s),
        ("close_grace_ms", s.close_grace_ms),
    ] {
        if value == 0 {
            return Err(VmctlError::Validation {
                message: format!("session.{field} must be greater than 0"),
            });
        }
    }

    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, origin: &Path) -> Result<Config, VmctlError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| VmctlError::ConfigParse {
        path: origin.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Load `path`, or the default config file when `path` is `None`.
///
/// A missing default file is not an error: search still works from the
/// cache, and `refresh` reports that no endpoints are configured.
pub fn load_config(path: Option<&Path>) -> Result<SystemConfig, VmctlError> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (paths::config_path(), false),
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(SystemConfig {
                config_path: None,
                config: Config::default(),
            });
        }
        Err(source) => {
            return Err(VmctlError::ConfigLoad {
                path: path.display().to_string(),
                source,
            });
        }
    };

    let config = parse_config(&contents, &path)?;
    Ok(SystemConfig {
        config_path: Some(path),
        config,
    })
}
