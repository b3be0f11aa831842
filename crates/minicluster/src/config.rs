//! Cluster configuration management.
//!
//! [`ConfigBuilder`] turns caller overrides into a fully resolved
//! [`ClusterConfig`]: storage root, instance identity, one port per service,
//! secrets and the property files the wrapped services read. The config is
//! immutable once provisioning starts.

use crate::ports::{PortAllocator, PortReservation};
use crate::{Error, Result, ServiceId, ServiceKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// What happens to the storage root once the cluster has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageDisposition {
    /// Delete the whole storage root.
    Remove,
    /// Leave it in place for the caller.
    Retain,
}

/// Where the coordination ensemble comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationMode {
    /// Spawn a private ensemble inside the storage root.
    Embedded,
    /// Use an ensemble that is already running at `host:port`.
    External { endpoint: String },
}

/// Credentials handed to the wrapped services.
#[derive(Clone)]
pub struct Secrets {
    pub root_password: String,
    pub instance_secret: String,
}

impl Default for Secrets {
    fn default() -> Self {
        Self {
            root_password: "notsecure".to_string(),
            instance_secret: "alsonotsecure".to_string(),
        }
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("root_password", &"<redacted>")
            .field("instance_secret", &"<redacted>")
            .finish()
    }
}

/// Fully resolved configuration for one cluster instance.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Name the engine registers the instance under.
    pub instance_name: String,

    /// Unique id, used in process names and the default storage root.
    pub instance_id: String,

    /// Root directory owned exclusively by this cluster.
    pub storage_root: PathBuf,

    /// Host services are reached on.
    pub host: String,

    /// Address services bind to, when different from `host`.
    pub bind_address: Option<String>,

    /// One port per service.
    pub ports: BTreeMap<ServiceId, u16>,

    /// Number of data-serving nodes (>= 1).
    pub data_nodes: usize,

    /// Readiness deadline for each service.
    pub startup_timeout: Duration,

    /// Deadline for the whole `start()` sequence.
    pub provisioning_timeout: Duration,

    /// Interval between readiness probes.
    pub poll_interval: Duration,

    /// Time a service gets to exit after SIGTERM before it is killed.
    pub stop_grace_period: Duration,

    /// Directory the data nodes load extension artifacts from.
    pub extension_dir: PathBuf,

    /// Fate of the storage root after stop.
    pub disposition: StorageDisposition,

    pub coordination: CoordinationMode,

    pub secrets: Secrets,

    /// Engine site properties, written to `conf/accumulo-site.xml`.
    pub site_properties: BTreeMap<String, String>,

    /// Coordination properties, written to `conf/zoo.cfg`.
    pub coordination_properties: BTreeMap<String, String>,

    /// Extra `-D` properties per service kind.
    pub jvm_properties: BTreeMap<ServiceKind, BTreeMap<String, String>>,

    /// Extra `-D` properties for the one-shot init command.
    pub init_jvm_properties: BTreeMap<String, String>,

    /// Mirror captured output into `logs/`.
    pub log_to_files: bool,

    /// Lines of output retained per process.
    pub output_capacity: usize,
}

#[derive(Serialize)]
struct Manifest<'a> {
    instance_name: &'a str,
    instance_id: &'a str,
    storage_root: &'a Path,
    host: &'a str,
    coordination_endpoint: String,
    data_nodes: usize,
    startup_timeout_ms: u64,
    provisioning_timeout_ms: u64,
    extension_dir: &'a Path,
    disposition: StorageDisposition,
    ports: BTreeMap<String, u16>,
}

impl ClusterConfig {
    /// Services this cluster spawns, in start order.
    pub fn services(&self) -> Vec<ServiceId> {
        let mut services = Vec::with_capacity(self.data_nodes + 3);
        if self.coordination == CoordinationMode::Embedded {
            services.push(ServiceId::COORDINATION);
        }
        services.push(ServiceId::MANAGER);
        services.push(ServiceId::GARBAGE_COLLECTOR);
        services.extend((0..self.data_nodes).map(ServiceId::data_node));
        services
    }

    /// Port allocated to `service`.
    pub fn port(&self, service: ServiceId) -> Option<u16> {
        self.ports.get(&service).copied()
    }

    /// Address probes use to reach `service`.
    pub fn socket_addr(&self, service: ServiceId) -> Result<SocketAddr> {
        let port = self
            .port(service)
            .ok_or_else(|| Error::Configuration(format!("no port allocated for {service}")))?;
        let ipv4 = probe_ip(self.bind_address.as_deref(), &self.host).is_ipv4();
        resolve(&self.host, port, ipv4)
    }

    /// `host:port` clients use to reach the coordination ensemble.
    pub fn coordination_endpoint(&self) -> String {
        match &self.coordination {
            CoordinationMode::External { endpoint } => endpoint.clone(),
            CoordinationMode::Embedded => format!(
                "{}:{}",
                self.host,
                self.port(ServiceId::COORDINATION).unwrap_or_default()
            ),
        }
    }

    /// Prefix for process names, e.g. `mac-<id>-tserver-0`.
    pub fn process_name(&self, service: ServiceId) -> String {
        format!("mac-{}-{}", self.instance_id, service)
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.storage_root.join("conf")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.storage_root.join("logs")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.storage_root.join("lib")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage_root.join("accumulo-data")
    }

    /// Private data directory of the embedded coordination ensemble.
    pub fn coordination_data_dir(&self) -> PathBuf {
        self.storage_root.join("coordination")
    }

    /// Working directory for one service.
    pub fn service_dir(&self, service: ServiceId) -> PathBuf {
        self.storage_root.join("services").join(service.to_string())
    }

    pub fn zoo_cfg_file(&self) -> PathBuf {
        self.conf_dir().join("zoo.cfg")
    }

    pub fn site_file(&self) -> PathBuf {
        self.conf_dir().join("accumulo-site.xml")
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.conf_dir().join("cluster.toml")
    }

    /// Marker written once the init step has succeeded.
    pub fn initialized_marker(&self) -> PathBuf {
        self.storage_root.join(".initialized")
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized_marker().exists()
    }

    /// Creates the directory structure and writes the service config files.
    ///
    /// Property files are rewritten on every call since ports change between
    /// runs; data directories of a reused root are left as they are.
    pub fn materialize(&self) -> Result<()> {
        for dir in [
            self.conf_dir(),
            self.log_dir(),
            self.data_dir(),
            self.extension_dir.clone(),
        ] {
            fs::create_dir_all(dir)?;
        }
        if self.coordination == CoordinationMode::Embedded {
            fs::create_dir_all(self.coordination_data_dir())?;
        }
        for service in self.services() {
            fs::create_dir_all(self.service_dir(service))?;
        }

        if self.coordination == CoordinationMode::Embedded {
            let content: String = self
                .coordination_properties
                .iter()
                .map(|(k, v)| format!("{k}={v}\n"))
                .collect();
            fs::write(self.zoo_cfg_file(), content)?;
        }

        fs::write(self.site_file(), render_site_xml(&self.site_properties))?;

        self.save_manifest()
    }

    /// Writes `conf/cluster.toml` describing this instance.
    pub fn save_manifest(&self) -> Result<()> {
        let manifest = Manifest {
            instance_name: &self.instance_name,
            instance_id: &self.instance_id,
            storage_root: &self.storage_root,
            host: &self.host,
            coordination_endpoint: self.coordination_endpoint(),
            data_nodes: self.data_nodes,
            startup_timeout_ms: self.startup_timeout.as_millis() as u64,
            provisioning_timeout_ms: self.provisioning_timeout.as_millis() as u64,
            extension_dir: &self.extension_dir,
            disposition: self.disposition,
            ports: self
                .ports
                .iter()
                .map(|(id, port)| (id.to_string(), *port))
                .collect(),
        };

        fs::create_dir_all(self.conf_dir())?;
        fs::write(self.manifest_file(), toml::to_string_pretty(&manifest)?)?;
        Ok(())
    }
}

/// Address the port allocator probes on: the bind address or host when it
/// is a literal IP, IPv4 loopback otherwise.
fn probe_ip(bind_address: Option<&str>, host: &str) -> IpAddr {
    bind_address
        .unwrap_or(host)
        .parse::<IpAddr>()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Resolves `host`, preferring an address of the family services bind to.
fn resolve(host: &str, port: u16, ipv4: bool) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4() == ipv4)
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Configuration(format!("host {host} did not resolve")))
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_site_xml(properties: &BTreeMap<String, String>) -> String {
    let mut xml = String::from("<configuration>\n");
    for (name, value) in properties {
        xml.push_str("  <property>\n");
        xml.push_str(&format!("    <name>{}</name>\n", escape_xml(name)));
        xml.push_str(&format!("    <value>{}</value>\n", escape_xml(value)));
        xml.push_str("  </property>\n");
    }
    xml.push_str("</configuration>\n");
    xml
}

/// Caller overrides for a cluster. Everything is optional.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    instance_name: Option<String>,
    instance_id: Option<String>,
    storage_root: Option<PathBuf>,
    reuse_storage: bool,
    fixed_ports: BTreeMap<ServiceId, u16>,
    data_nodes: usize,
    host: String,
    bind_address: Option<String>,
    startup_timeout: Duration,
    provisioning_timeout: Duration,
    poll_interval: Duration,
    stop_grace_period: Duration,
    extension_dir: Option<PathBuf>,
    disposition: Option<StorageDisposition>,
    coordination: CoordinationMode,
    secrets: Secrets,
    site_properties: BTreeMap<String, String>,
    coordination_properties: BTreeMap<String, String>,
    jvm_properties: BTreeMap<ServiceKind, BTreeMap<String, String>>,
    init_jvm_properties: BTreeMap<String, String>,
    log_to_files: bool,
    output_capacity: usize,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        let mut coordination_properties = BTreeMap::new();
        coordination_properties.insert("tickTime".to_string(), "2000".to_string());
        coordination_properties.insert("maxClientCnxns".to_string(), "1000".to_string());
        coordination_properties.insert(
            "4lw.commands.whitelist".to_string(),
            "srvr,ruok".to_string(),
        );

        let mut jvm_properties = BTreeMap::new();
        jvm_properties.insert(
            ServiceKind::Coordination,
            BTreeMap::from([(
                "zookeeper.jmx.log4j.disable".to_string(),
                "true".to_string(),
            )]),
        );

        Self {
            instance_name: None,
            instance_id: None,
            storage_root: None,
            reuse_storage: false,
            fixed_ports: BTreeMap::new(),
            data_nodes: 2,
            host: "127.0.0.1".to_string(),
            bind_address: None,
            startup_timeout: Duration::from_secs(10),
            provisioning_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(250),
            stop_grace_period: Duration::from_secs(5),
            extension_dir: None,
            disposition: None,
            coordination: CoordinationMode::Embedded,
            secrets: Secrets::default(),
            site_properties: BTreeMap::new(),
            coordination_properties,
            jvm_properties,
            init_jvm_properties: BTreeMap::new(),
            log_to_files: false,
            output_capacity: crate::output::DEFAULT_CAPACITY,
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Use `root` instead of a fresh directory under the system temp dir.
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    /// Allow a storage root that already has content.
    pub fn reuse_storage(mut self, reuse: bool) -> Self {
        self.reuse_storage = reuse;
        self
    }

    /// Pin `service` to `port` instead of allocating one.
    pub fn fixed_port(mut self, service: ServiceId, port: u16) -> Self {
        self.fixed_ports.insert(service, port);
        self
    }

    pub fn data_nodes(mut self, count: usize) -> Self {
        self.data_nodes = count;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = Some(address.into());
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn provisioning_timeout(mut self, timeout: Duration) -> Self {
        self.provisioning_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn extension_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extension_dir = Some(dir.into());
        self
    }

    pub fn disposition(mut self, disposition: StorageDisposition) -> Self {
        self.disposition = Some(disposition);
        self
    }

    /// Use an already running coordination ensemble at `endpoint` (`host:port`).
    pub fn external_coordination(mut self, endpoint: impl Into<String>) -> Self {
        self.coordination = CoordinationMode::External {
            endpoint: endpoint.into(),
        };
        self
    }

    pub fn root_password(mut self, password: impl Into<String>) -> Self {
        self.secrets.root_password = password.into();
        self
    }

    pub fn instance_secret(mut self, secret: impl Into<String>) -> Self {
        self.secrets.instance_secret = secret.into();
        self
    }

    pub fn site_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.site_properties.insert(key.into(), value.into());
        self
    }

    pub fn coordination_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.coordination_properties.insert(key.into(), value.into());
        self
    }

    pub fn jvm_property(
        mut self,
        kind: ServiceKind,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.jvm_properties
            .entry(kind)
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn init_jvm_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.init_jvm_properties.insert(key.into(), value.into());
        self
    }

    /// Set a `-D` property on every service and on the init command.
    pub fn global_jvm_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        for kind in ServiceKind::START_ORDER {
            self = self.jvm_property(kind, key.clone(), value.clone());
        }
        self.init_jvm_property(key, value)
    }

    pub fn log_to_files(mut self, enabled: bool) -> Self {
        self.log_to_files = enabled;
        self
    }

    pub fn output_capacity(mut self, lines: usize) -> Self {
        self.output_capacity = lines;
        self
    }

    /// Resolves every setting and reserves the ports.
    ///
    /// Touches nothing on disk; [`ClusterConfig::materialize`] does that.
    pub fn build(self) -> Result<(ClusterConfig, PortReservation)> {
        self.validate()?;

        let instance_id = self
            .instance_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let instance_name = self
            .instance_name
            .unwrap_or_else(|| format!("mac-{}", instance_id.chars().take(8).collect::<String>()));

        let (storage_root, pre_existing) = match self.storage_root {
            Some(root) => {
                let existed = check_storage_root(&root, self.reuse_storage)?;
                (root, existed)
            }
            None => (
                std::env::temp_dir().join(format!("mac-{instance_id}")),
                false,
            ),
        };
        let storage_root = if storage_root.is_relative() {
            std::env::current_dir()?.join(storage_root)
        } else {
            storage_root
        };

        let disposition = self.disposition.unwrap_or(if pre_existing {
            StorageDisposition::Retain
        } else {
            StorageDisposition::Remove
        });

        let mut services = Vec::with_capacity(self.data_nodes + 3);
        if self.coordination == CoordinationMode::Embedded {
            services.push(ServiceId::COORDINATION);
        }
        services.push(ServiceId::MANAGER);
        services.push(ServiceId::GARBAGE_COLLECTOR);
        services.extend((0..self.data_nodes).map(ServiceId::data_node));

        for service in self.fixed_ports.keys() {
            if !services.contains(service) {
                return Err(Error::Configuration(format!(
                    "fixed port given for {service}, which this cluster does not run"
                )));
            }
        }

        let probe_host = probe_ip(self.bind_address.as_deref(), &self.host);
        let fixed: Vec<u16> = services
            .iter()
            .filter_map(|s| self.fixed_ports.get(s).copied())
            .collect();
        let floating = services.len() - fixed.len();
        let reservation = PortAllocator::new(probe_host).reserve_with(&fixed, floating)?;

        let mut next_allocated = reservation.allocated().iter().copied();
        let mut ports = BTreeMap::new();
        for service in &services {
            let port = match self.fixed_ports.get(service) {
                Some(port) => *port,
                None => next_allocated.next().ok_or_else(|| Error::PortAllocation {
                    requested: floating,
                    found: reservation.allocated().len(),
                    attempts: 0,
                })?,
            };
            ports.insert(*service, port);
        }

        let extension_dir = self
            .extension_dir
            .unwrap_or_else(|| storage_root.join("lib").join("ext"));

        let mut config = ClusterConfig {
            instance_name,
            instance_id,
            storage_root,
            host: self.host,
            bind_address: self.bind_address,
            ports,
            data_nodes: self.data_nodes,
            startup_timeout: self.startup_timeout,
            provisioning_timeout: self.provisioning_timeout,
            poll_interval: self.poll_interval,
            stop_grace_period: self.stop_grace_period,
            extension_dir,
            disposition,
            coordination: self.coordination,
            secrets: self.secrets,
            site_properties: self.site_properties,
            coordination_properties: self.coordination_properties,
            jvm_properties: self.jvm_properties,
            init_jvm_properties: self.init_jvm_properties,
            log_to_files: self.log_to_files,
            output_capacity: self.output_capacity,
        };
        apply_defaults(&mut config);

        Ok((config, reservation))
    }

    fn validate(&self) -> Result<()> {
        if self.data_nodes == 0 {
            return Err(Error::Configuration(
                "data node count must be greater than 0".into(),
            ));
        }
        for (name, value) in [
            ("startup timeout", self.startup_timeout),
            ("provisioning timeout", self.provisioning_timeout),
            ("poll interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Configuration(format!("{name} must be non-zero")));
            }
        }
        if let CoordinationMode::External { endpoint } = &self.coordination {
            if self.fixed_ports.contains_key(&ServiceId::COORDINATION) {
                return Err(Error::Configuration(
                    "coordination port cannot be fixed when using an external ensemble".into(),
                ));
            }
            if !endpoint.contains(':') {
                return Err(Error::Configuration(format!(
                    "external coordination endpoint '{endpoint}' must be host:port"
                )));
            }
        }
        Ok(())
    }
}

/// Returns whether `root` already existed.
fn check_storage_root(root: &Path, reuse: bool) -> Result<bool> {
    if !root.exists() {
        return Ok(false);
    }
    if !root.is_dir() {
        return Err(Error::Configuration(format!(
            "storage root {} is not a directory",
            root.display()
        )));
    }
    let non_empty = fs::read_dir(root)?.next().is_some();
    if non_empty && !reuse {
        return Err(Error::Configuration(format!(
            "storage root {} is not empty and reuse was not requested",
            root.display()
        )));
    }
    Ok(true)
}

fn apply_defaults(config: &mut ClusterConfig) {
    let endpoint = config.coordination_endpoint();
    let lib_dir = config.lib_dir();
    let defaults = [
        ("tserver.memory.maps.native.enabled", "false".to_string()),
        ("instance.secret", config.secrets.instance_secret.clone()),
        (
            "instance.volumes",
            format!("file://{}", config.data_dir().display()),
        ),
        (
            "general.classpaths",
            format!("{}/[^.].*[.]jar", lib_dir.display()),
        ),
        (
            "general.dynamic.classpaths",
            format!("{}/[^.].*[.]jar", config.extension_dir.display()),
        ),
        ("instance.zookeeper.host", endpoint),
    ];
    for (key, value) in defaults {
        config
            .site_properties
            .entry(key.to_string())
            .or_insert(value);
    }

    if let Some(port) = config.port(ServiceId::COORDINATION) {
        let data_dir = config.coordination_data_dir().display().to_string();
        config
            .coordination_properties
            .insert("clientPort".to_string(), port.to_string());
        config
            .coordination_properties
            .insert("dataDir".to_string(), data_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn in_temp(temp: &TempDir) -> ConfigBuilder {
        ConfigBuilder::new().storage_root(temp.path().join("mac"))
    }

    #[test]
    fn test_default_build() {
        let temp = TempDir::new().unwrap();
        let (config, reservation) = in_temp(&temp).build().unwrap();

        assert_eq!(config.data_nodes, 2);
        assert_eq!(config.services().len(), 5);
        assert_eq!(config.ports.len(), 5);
        assert_eq!(reservation.ports().count(), 5);
        assert_eq!(config.disposition, StorageDisposition::Remove);
        assert!(config.instance_name.starts_with("mac-"));

        let distinct: HashSet<u16> = config.ports.values().copied().collect();
        assert_eq!(distinct.len(), 5);
    }

    #[test]
    fn test_default_storage_root_under_temp() {
        let (config, _reservation) = ConfigBuilder::new().instance_id("abc").build().unwrap();
        assert_eq!(config.storage_root, std::env::temp_dir().join("mac-abc"));
    }

    #[test]
    fn test_multibyte_instance_id() {
        let (config, _reservation) = ConfigBuilder::new()
            .instance_id("aéééééééé")
            .build()
            .unwrap();
        assert_eq!(config.instance_name, "mac-aééééééé");
    }

    #[test]
    fn test_localhost_probes_bind_family() {
        let temp = TempDir::new().unwrap();
        let (config, _reservation) = in_temp(&temp)
            .host("localhost")
            .bind_address("0.0.0.0")
            .build()
            .unwrap();
        assert!(config.socket_addr(ServiceId::data_node(0)).unwrap().is_ipv4());

        let temp = TempDir::new().unwrap();
        let (config, _reservation) = in_temp(&temp).host("localhost").build().unwrap();
        assert!(config.socket_addr(ServiceId::MANAGER).unwrap().is_ipv4());
    }

    #[test]
    fn test_resolve_falls_back_to_other_family() {
        let addr = resolve("127.0.0.1", 4000, false).unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
    }

    #[test]
    fn test_non_empty_root_requires_reuse() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("leftover"), "x").unwrap();

        let err = ConfigBuilder::new()
            .storage_root(temp.path())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let (config, _reservation) = ConfigBuilder::new()
            .storage_root(temp.path())
            .reuse_storage(true)
            .build()
            .unwrap();
        assert_eq!(config.disposition, StorageDisposition::Retain);
    }

    #[test]
    fn test_zero_data_nodes_rejected() {
        let err = ConfigBuilder::new().data_nodes(0).build().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_fixed_port_is_used() {
        let temp = TempDir::new().unwrap();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (config, reservation) = in_temp(&temp)
            .fixed_port(ServiceId::COORDINATION, port)
            .build()
            .unwrap();

        assert_eq!(config.port(ServiceId::COORDINATION), Some(port));
        assert_eq!(reservation.fixed(), [port]);
        assert_eq!(config.coordination_endpoint(), format!("127.0.0.1:{port}"));
        assert_eq!(
            config.coordination_properties.get("clientPort"),
            Some(&port.to_string())
        );
    }

    #[test]
    fn test_fixed_port_for_unknown_service() {
        let err = ConfigBuilder::new()
            .data_nodes(1)
            .fixed_port(ServiceId::data_node(3), 40_001)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_external_coordination() {
        let temp = TempDir::new().unwrap();
        let (config, _reservation) = in_temp(&temp)
            .external_coordination("zk.example:2181")
            .build()
            .unwrap();

        assert!(config.port(ServiceId::COORDINATION).is_none());
        assert_eq!(config.coordination_endpoint(), "zk.example:2181");
        assert_eq!(
            config.site_properties.get("instance.zookeeper.host"),
            Some(&"zk.example:2181".to_string())
        );
        assert!(!config.services().contains(&ServiceId::COORDINATION));
    }

    #[test]
    fn test_caller_site_properties_win() {
        let temp = TempDir::new().unwrap();
        let (config, _reservation) = in_temp(&temp)
            .site_property("instance.secret", "custom")
            .build()
            .unwrap();
        assert_eq!(
            config.site_properties.get("instance.secret"),
            Some(&"custom".to_string())
        );
    }

    #[test]
    fn test_materialize_writes_files() {
        let temp = TempDir::new().unwrap();
        let (config, _reservation) = in_temp(&temp)
            .site_property("custom.value", "a<b&c")
            .build()
            .unwrap();

        config.materialize().unwrap();

        assert!(config.extension_dir.is_dir());
        assert!(config.coordination_data_dir().is_dir());
        assert!(config.service_dir(ServiceId::data_node(1)).is_dir());

        let zoo = fs::read_to_string(config.zoo_cfg_file()).unwrap();
        assert!(zoo.contains("tickTime=2000"));
        assert!(zoo.contains("4lw.commands.whitelist=srvr,ruok"));

        let site = fs::read_to_string(config.site_file()).unwrap();
        assert!(site.contains("<value>a&lt;b&amp;c</value>"));

        let manifest = fs::read_to_string(config.manifest_file()).unwrap();
        assert!(manifest.contains(&config.instance_name));
        assert!(manifest.contains("tserver-1"));
    }

    #[test]
    fn test_global_jvm_property() {
        let temp = TempDir::new().unwrap();
        let (config, _reservation) = in_temp(&temp)
            .global_jvm_property("root_log_level", "ERROR")
            .build()
            .unwrap();

        for kind in ServiceKind::START_ORDER {
            assert_eq!(
                config.jvm_properties[&kind].get("root_log_level"),
                Some(&"ERROR".to_string())
            );
        }
        assert!(config.init_jvm_properties.contains_key("root_log_level"));
    }

    #[test]
    fn test_secrets_are_redacted() {
        let debug = format!("{:?}", Secrets::default());
        assert!(!debug.contains("notsecure"));
    }
}
