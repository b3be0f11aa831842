//! Container settings.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file given with `--settings`
//! 3. Environment variables (`MAC_*`, e.g. `MAC_NUM_TSERVERS=3`; plain
//!    `ROOT_LOG_LEVEL` is read when `MAC_ROOT_LOG_LEVEL` is not set)

use anyhow::{Context, Result, bail};
use minicluster::{ConfigBuilder, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MAC";

/// Unprefixed engine log level still honored when `MAC_ROOT_LOG_LEVEL`
/// is unset.
pub const LEGACY_ROOT_LOG_LEVEL: &str = "ROOT_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub instance_name: Option<String>,
    pub root_password: Option<String>,
    pub base_dir: Option<PathBuf>,
    pub zookeeper_host: String,
    pub zookeeper_port: u16,
    pub use_external_zookeeper: bool,
    pub zookeeper_startup_timeout_ms: u64,
    pub num_tservers: usize,
    pub file_logging: bool,
    pub accumulo_bind_address: Option<String>,
    pub in_docker_container: bool,
    pub extension_mount: PathBuf,
    pub watch_interval_ms: u64,
    pub java_home: Option<PathBuf>,
    pub classpath: Option<String>,
    pub log_level: String,
    /// Log level handed to the wrapped engine processes.
    pub root_log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instance_name: None,
            root_password: None,
            base_dir: None,
            zookeeper_host: "localhost".to_string(),
            zookeeper_port: 21811,
            use_external_zookeeper: false,
            zookeeper_startup_timeout_ms: 20_000,
            num_tservers: 2,
            file_logging: false,
            accumulo_bind_address: None,
            in_docker_container: false,
            extension_mount: PathBuf::from("/app/lib/ext"),
            watch_interval_ms: 2_000,
            java_home: None,
            classpath: None,
            log_level: "info".to_string(),
            root_log_level: "ERROR".to_string(),
        }
    }
}

/// Loads [`Settings`] from every source.
pub struct SettingsLoader {
    file: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env: None,
        }
    }

    /// Reads a TOML settings file on top of the defaults.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Uses `vars` instead of the process environment.
    pub fn with_env(mut self, vars: HashMap<String, String>) -> Self {
        self.env = Some(vars);
        self
    }

    pub fn load(self) -> Result<Settings> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?);

        if let Some(file) = &self.file {
            if !file.exists() {
                bail!("Settings file {} does not exist", file.display());
            }
            builder = builder.add_source(
                config::File::from(file.as_path())
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        let lookup = |key: &str| match &self.env {
            Some(vars) => vars.get(key).cloned(),
            None => std::env::var(key).ok(),
        };
        if lookup("MAC_ROOT_LOG_LEVEL").is_none() {
            builder = builder.set_override_option("root_log_level", lookup(LEGACY_ROOT_LOG_LEVEL))?;
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(self.env),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to build settings")?
            .try_deserialize()
            .context("Failed to deserialize settings")?;
        settings.validate()?;
        Ok(settings)
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    fn validate(&self) -> Result<()> {
        if self.num_tservers == 0 {
            bail!("MAC_NUM_TSERVERS must be at least 1");
        }
        if self.zookeeper_port == 0 {
            bail!("MAC_ZOOKEEPER_PORT must be a fixed port");
        }
        if self.watch_interval_ms == 0 {
            bail!("MAC_WATCH_INTERVAL_MS must be non-zero");
        }
        Ok(())
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    /// Path of the `java` binary, if a Java home was configured.
    pub fn java(&self) -> Option<PathBuf> {
        self.java_home
            .as_ref()
            .map(|home| home.join("bin").join("java"))
    }

    /// Address the engine processes bind to. Inside a container they listen
    /// on every interface so the published ports are reachable.
    pub fn bind_address(&self) -> Option<String> {
        match &self.accumulo_bind_address {
            Some(address) if !address.is_empty() => Some(address.clone()),
            _ if self.in_docker_container => Some("0.0.0.0".to_string()),
            _ => None,
        }
    }

    /// Translates the settings into cluster overrides.
    pub fn to_builder(&self) -> ConfigBuilder {
        let startup = Duration::from_millis(self.zookeeper_startup_timeout_ms);
        let mut builder = ConfigBuilder::new()
            .data_nodes(self.num_tservers)
            .host(&self.zookeeper_host)
            .log_to_files(self.file_logging)
            .startup_timeout(startup)
            .global_jvm_property("root_log_level", &self.root_log_level);

        builder = if self.use_external_zookeeper {
            builder.external_coordination(format!(
                "{}:{}",
                self.zookeeper_host, self.zookeeper_port
            ))
        } else {
            builder.fixed_port(ServiceId::COORDINATION, self.zookeeper_port)
        };

        if let Some(name) = &self.instance_name {
            builder = builder.instance_name(name);
        }
        if let Some(password) = &self.root_password {
            builder = builder.root_password(password);
        }
        if let Some(dir) = &self.base_dir {
            builder = builder.storage_root(dir).reuse_storage(true);
        }
        if let Some(address) = self.bind_address() {
            builder = builder.bind_address(address);
        }
        builder
    }
}
