//! Command lines for the wrapped service processes.
//!
//! The orchestrator knows nothing about how a service is started. A
//! [`ServiceLauncher`] turns the resolved [`ClusterConfig`] into one
//! [`ServiceCommand`] per service, plus an optional one-shot init command.
//! [`JvmLauncher`] is the default and runs the engine's Java main classes.

use crate::{ClusterConfig, Error, Result, ServiceId, ServiceKind};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Program, arguments, environment and working directory of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ServiceCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for ServiceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Builds the kind-specific command line for each service.
pub trait ServiceLauncher: Send + Sync + fmt::Debug {
    /// Command that runs `service` for the cluster described by `config`.
    fn service_command(&self, config: &ClusterConfig, service: ServiceId) -> Result<ServiceCommand>;

    /// One-shot command run after coordination is ready and before the
    /// manager starts. `None` skips the step.
    fn init_command(&self, _config: &ClusterConfig) -> Result<Option<ServiceCommand>> {
        Ok(None)
    }
}

/// Produces the `-cp` argument for spawned JVMs.
///
/// Lets callers inject jars (custom iterators, for instance) that are not
/// on the default classpath.
pub trait ClasspathLoader: Send + Sync + fmt::Debug {
    fn classpath(&self) -> Result<String>;
}

/// Classpath from the `CLASSPATH` variable, jars found in library
/// directories, and explicit extra entries, in that order.
///
/// Directories holding `*site.xml` files are skipped so a stray site config
/// on the host classpath cannot shadow the one generated for the cluster.
#[derive(Debug, Clone, Default)]
pub struct DefaultClasspathLoader {
    base: Option<String>,
    lib_dirs: Vec<PathBuf>,
    extra: Vec<PathBuf>,
}

impl DefaultClasspathLoader {
    /// Loader seeded from the `CLASSPATH` environment variable.
    pub fn from_env() -> Self {
        Self {
            base: std::env::var("CLASSPATH").ok(),
            ..Self::default()
        }
    }

    /// Loader seeded from an explicit classpath string.
    pub fn with_base(mut self, classpath: impl Into<String>) -> Self {
        self.base = Some(classpath.into());
        self
    }

    /// Add every `*.jar` in `dir`.
    pub fn with_lib_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lib_dirs.push(dir.into());
        self
    }

    pub fn with_extra(mut self, entry: impl Into<PathBuf>) -> Self {
        self.extra.push(entry.into());
        self
    }
}

fn contains_site_file(path: &Path) -> bool {
    let Ok(entries) = fs::read_dir(path) else {
        return false;
    };
    entries
        .flatten()
        .any(|e| e.file_name().to_string_lossy().ends_with("site.xml"))
}

impl ClasspathLoader for DefaultClasspathLoader {
    fn classpath(&self) -> Result<String> {
        let mut entries: Vec<PathBuf> = Vec::new();

        if let Some(base) = &self.base {
            entries.extend(
                std::env::split_paths(base)
                    .filter(|p| !p.as_os_str().is_empty())
                    .filter(|p| !(p.is_dir() && contains_site_file(p))),
            );
        }

        for dir in &self.lib_dirs {
            let mut jars: Vec<PathBuf> = fs::read_dir(dir)?
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "jar"))
                .collect();
            jars.sort();
            entries.extend(jars);
        }

        entries.extend(self.extra.iter().cloned());

        let joined: OsString = std::env::join_paths(entries)
            .map_err(|e| Error::Configuration(format!("invalid classpath entry: {e}")))?;
        let classpath = joined
            .into_string()
            .map_err(|_| Error::Configuration("classpath is not valid UTF-8".into()))?;
        tracing::trace!(%classpath, "classpath for spawned processes");
        Ok(classpath)
    }
}

/// Launches each service as a JVM running the engine's main classes.
#[derive(Debug, Clone)]
pub struct JvmLauncher {
    java: PathBuf,
    classpath: Arc<dyn ClasspathLoader>,
    main_classes: BTreeMap<ServiceKind, String>,
    init_class: Option<String>,
}

impl JvmLauncher {
    pub fn new(classpath: Arc<dyn ClasspathLoader>) -> Self {
        let java = std::env::var_os("JAVA_HOME")
            .map(|home| PathBuf::from(home).join("bin").join("java"))
            .unwrap_or_else(|| PathBuf::from("java"));

        let main_classes = BTreeMap::from([
            (
                ServiceKind::Coordination,
                "org.apache.zookeeper.server.ZooKeeperServerMain".to_string(),
            ),
            (
                ServiceKind::Manager,
                "org.apache.accumulo.master.Master".to_string(),
            ),
            (
                ServiceKind::GarbageCollector,
                "org.apache.accumulo.gc.SimpleGarbageCollector".to_string(),
            ),
            (
                ServiceKind::DataNode,
                "org.apache.accumulo.tserver.TabletServer".to_string(),
            ),
        ]);

        Self {
            java,
            classpath,
            main_classes,
            init_class: Some("org.apache.accumulo.server.init.Initialize".to_string()),
        }
    }

    /// Path to the `java` binary.
    pub fn with_java(mut self, java: impl Into<PathBuf>) -> Self {
        self.java = java.into();
        self
    }

    pub fn with_main_class(mut self, kind: ServiceKind, class: impl Into<String>) -> Self {
        self.main_classes.insert(kind, class.into());
        self
    }

    /// Main class of the init step, `None` to skip it.
    pub fn with_init_class(mut self, class: Option<String>) -> Self {
        self.init_class = class;
        self
    }

    fn port_property(kind: ServiceKind) -> Option<&'static str> {
        match kind {
            ServiceKind::Coordination => None,
            ServiceKind::Manager => Some("master.port.client"),
            ServiceKind::GarbageCollector => Some("gc.port.client"),
            ServiceKind::DataNode => Some("tserver.port.client"),
        }
    }

    fn jvm(
        &self,
        config: &ClusterConfig,
        process_name: &str,
        properties: Option<&BTreeMap<String, String>>,
        main_class: &str,
    ) -> Result<ServiceCommand> {
        let mut classpath = config.conf_dir().display().to_string();
        let loaded = self.classpath.classpath()?;
        if !loaded.is_empty() {
            classpath.push(if cfg!(windows) { ';' } else { ':' });
            classpath.push_str(&loaded);
        }

        let mut command = ServiceCommand::new(&self.java)
            .arg(format!("-Dproc={process_name}"))
            .arg("-cp")
            .arg(classpath);
        for (key, value) in properties.into_iter().flatten() {
            command = command.arg(format!("-D{key}={value}"));
        }

        Ok(command
            .arg(main_class)
            .env("ACCUMULO_LOG_DIR", config.log_dir().display().to_string())
            .env("ACCUMULO_CONF_DIR", config.conf_dir().display().to_string()))
    }
}

impl ServiceLauncher for JvmLauncher {
    fn service_command(&self, config: &ClusterConfig, service: ServiceId) -> Result<ServiceCommand> {
        let main_class = self
            .main_classes
            .get(&service.kind)
            .ok_or_else(|| Error::Configuration(format!("no main class for {}", service.kind)))?;

        let mut command = self
            .jvm(
                config,
                &config.process_name(service),
                config.jvm_properties.get(&service.kind),
                main_class,
            )?
            .working_dir(config.service_dir(service));

        match Self::port_property(service.kind) {
            None => {
                command = command.arg(config.zoo_cfg_file().display().to_string());
            }
            Some(property) => {
                let port = config.port(service).ok_or_else(|| {
                    Error::Configuration(format!("no port allocated for {service}"))
                })?;
                let address = config.bind_address.as_deref().unwrap_or(&config.host);
                command = command
                    .args(["-a", address])
                    .arg("-o")
                    .arg(format!("{property}={port}"));
            }
        }
        Ok(command)
    }

    fn init_command(&self, config: &ClusterConfig) -> Result<Option<ServiceCommand>> {
        let Some(class) = &self.init_class else {
            return Ok(None);
        };
        let name = format!("mac-{}-init", config.instance_id);
        let command = self
            .jvm(config, &name, Some(&config.init_jvm_properties), class)?
            .working_dir(&config.storage_root)
            .args([
                "--instance-name",
                config.instance_name.as_str(),
                "--password",
                config.secrets.root_password.as_str(),
                "--clear-instance-name",
            ]);
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_default_loader_collects_jars_in_order() {
        let temp = TempDir::new().unwrap();
        let lib = temp.path().join("lib");
        fs::create_dir(&lib).unwrap();
        fs::write(lib.join("b.jar"), "").unwrap();
        fs::write(lib.join("a.jar"), "").unwrap();
        fs::write(lib.join("notes.txt"), "").unwrap();

        let classpath = DefaultClasspathLoader::default()
            .with_base("/opt/base.jar")
            .with_lib_dir(&lib)
            .with_extra("/opt/extra")
            .classpath()
            .unwrap();

        let parts: Vec<PathBuf> = std::env::split_paths(&classpath).collect();
        assert_eq!(
            parts,
            vec![
                PathBuf::from("/opt/base.jar"),
                lib.join("a.jar"),
                lib.join("b.jar"),
                PathBuf::from("/opt/extra"),
            ]
        );
    }

    #[test]
    fn test_default_loader_skips_site_dirs() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("accumulo-site.xml"), "").unwrap();

        let classpath = DefaultClasspathLoader::default()
            .with_base(temp.path().display().to_string())
            .classpath()
            .unwrap();
        assert!(classpath.is_empty());
    }

    #[test]
    fn test_jvm_data_node_command() {
        let temp = TempDir::new().unwrap();
        let (config, _reservation) = ConfigBuilder::new()
            .storage_root(temp.path().join("mac"))
            .jvm_property(ServiceKind::DataNode, "xss", "1m")
            .build()
            .unwrap();
        let launcher = JvmLauncher::new(Arc::new(DefaultClasspathLoader::default()))
            .with_java("/usr/bin/java");

        let service = ServiceId::data_node(1);
        let command = launcher.service_command(&config, service).unwrap();
        let port = config.port(service).unwrap();

        assert_eq!(command.program, PathBuf::from("/usr/bin/java"));
        assert!(command.args.contains(&"-Dxss=1m".to_string()));
        assert!(command.args.contains(&"org.apache.accumulo.tserver.TabletServer".to_string()));
        assert!(command.args.contains(&format!("tserver.port.client={port}")));
        assert_eq!(command.working_dir, Some(config.service_dir(service)));
        assert_eq!(command.args[1], "-cp");
        assert!(command.args[2].starts_with(&config.conf_dir().display().to_string()));
    }

    #[test]
    fn test_jvm_coordination_command_points_at_zoo_cfg() {
        let temp = TempDir::new().unwrap();
        let (config, _reservation) = ConfigBuilder::new()
            .storage_root(temp.path().join("mac"))
            .build()
            .unwrap();
        let launcher = JvmLauncher::new(Arc::new(DefaultClasspathLoader::default()));

        let command = launcher
            .service_command(&config, ServiceId::COORDINATION)
            .unwrap();

        assert_eq!(
            command.args.last(),
            Some(&config.zoo_cfg_file().display().to_string())
        );
        assert!(command.args.contains(&"-Dzookeeper.jmx.log4j.disable=true".to_string()));
    }

    #[test]
    fn test_jvm_init_command() {
        let temp = TempDir::new().unwrap();
        let (config, _reservation) = ConfigBuilder::new()
            .storage_root(temp.path().join("mac"))
            .instance_name("it")
            .root_password("pw")
            .build()
            .unwrap();
        let launcher = JvmLauncher::new(Arc::new(DefaultClasspathLoader::default()));

        let command = launcher.init_command(&config).unwrap().unwrap();
        let rendered = command.to_string();
        assert!(rendered.contains("--instance-name it --password pw"));

        let skipped = launcher.with_init_class(None).init_command(&config).unwrap();
        assert!(skipped.is_none());
    }
}
