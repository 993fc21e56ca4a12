//! Configuration for the plugin runtime.
//!
//! Three kinds of configuration reach a running plugin: the plugin
//! config (network, scheduler, transaction, cache, and rate-limit
//! settings), device configs (prototypes and their instances), and
//! command-line flags. Files are TOML. The plugin config is searched
//! for as `config.toml` in `.`, `./config`, and
//! `/etc/synse/plugin/config`, with device configs in mirrored
//! `device/` subdirectories; the `PLUGIN_CONFIG` and
//! `PLUGIN_DEVICE_CONFIG` environment variables override the search
//! with an explicit path.

use manifold_api::{types::MultiError, Error, Result};
use serde_derive::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

fn def_log_level() -> String {
    String::from("warn")
}

fn def_address() -> String {
    String::from("0.0.0.0:5001")
}

fn def_network_type() -> String {
    String::from("tcp")
}

fn def_mode() -> String {
    String::from("serial")
}

fn def_interval() -> f64 {
    1.0
}

fn def_buffer() -> usize {
    100
}

fn def_write_max() -> usize {
    100
}

fn def_transaction_ttl() -> f64 {
    300.0
}

fn def_cache_ttl() -> f64 {
    180.0
}

/// How the scheduler drives reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One read/write at a time, in configuration order.
    Serial,
    /// Concurrent reads; writes fan out to a worker pool.
    Parallel,
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "def_log_level")]
    log_level: String,

    /// Identity string the plugin-namespace UUID is derived from.
    /// When unset, the identity comes from the plugin metadata.
    pub id: Option<String>,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub dynamic_registration: DynamicRegistration,
}

impl Config {
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        }
    }

    /// Checks the values that have hard requirements. All problems
    /// are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut errs = MultiError::new();

        errs.absorb(self.settings.mode());

        if self.settings.read.buffer == 0 {
            errs.push(Error::Config("read buffer must be > 0".into()))
        }
        if self.settings.write.buffer == 0 {
            errs.push(Error::Config("write buffer must be > 0".into()))
        }
        if self.settings.write.max == 0 {
            errs.push(Error::Config("write max must be > 0".into()))
        }
        if self.settings.read.interval <= 0.0 {
            errs.push(Error::Config("read interval must be > 0".into()))
        }
        if self.settings.write.interval <= 0.0 {
            errs.push(Error::Config("write interval must be > 0".into()))
        }
        if self.settings.transaction.ttl <= 0.0 {
            errs.push(Error::Config("transaction TTL must be > 0".into()))
        }
        if self.settings.cache.ttl <= 0.0 {
            errs.push(Error::Config("cache TTL must be > 0".into()))
        }
        if let Some(limiter) = &self.settings.limiter {
            if limiter.rate <= 0.0 {
                errs.push(Error::Config("limiter rate must be > 0".into()))
            }
        }

        errs.into_result()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: def_log_level(),
            id: None,
            network: NetworkConfig::default(),
            settings: Settings::default(),
            dynamic_registration: DynamicRegistration::default(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "def_address")]
    pub address: String,

    #[serde(rename = "type", default = "def_network_type")]
    pub network_type: String,

    pub tls: Option<TlsConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            address: def_address(),
            network_type: def_network_type(),
            tls: None,
        }
    }
}

/// Optional TLS material for the listening socket. The wire layer
/// consumes this; the core only carries it.
#[derive(Deserialize, Clone)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

#[derive(Deserialize, Default)]
pub struct Settings {
    #[serde(default = "def_mode")]
    mode: String,

    #[serde(default)]
    pub read: ReadSettings,

    #[serde(default)]
    pub write: WriteSettings,

    #[serde(default)]
    pub transaction: TransactionSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    pub limiter: Option<LimiterSettings>,
}

impl Settings {
    pub fn mode(&self) -> Result<Mode> {
        match self.mode.as_str() {
            "serial" | "" => Ok(Mode::Serial),
            "parallel" => Ok(Mode::Parallel),
            v => Err(Error::Config(format!("unknown scheduler mode \"{}\"", v))),
        }
    }
}

#[derive(Deserialize)]
pub struct ReadSettings {
    #[serde(default = "def_interval")]
    pub interval: f64,

    #[serde(default = "def_buffer")]
    pub buffer: usize,

    #[serde(default)]
    pub disable: bool,
}

impl ReadSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }
}

impl Default for ReadSettings {
    fn default() -> Self {
        ReadSettings {
            interval: def_interval(),
            buffer: def_buffer(),
            disable: false,
        }
    }
}

#[derive(Deserialize)]
pub struct WriteSettings {
    #[serde(default = "def_interval")]
    pub interval: f64,

    #[serde(default = "def_buffer")]
    pub buffer: usize,

    #[serde(default = "def_write_max")]
    pub max: usize,

    #[serde(default)]
    pub disable: bool,
}

impl WriteSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }
}

impl Default for WriteSettings {
    fn default() -> Self {
        WriteSettings {
            interval: def_interval(),
            buffer: def_buffer(),
            max: def_write_max(),
            disable: false,
        }
    }
}

#[derive(Deserialize)]
pub struct TransactionSettings {
    #[serde(default = "def_transaction_ttl")]
    pub ttl: f64,
}

impl TransactionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.ttl)
    }
}

impl Default for TransactionSettings {
    fn default() -> Self {
        TransactionSettings {
            ttl: def_transaction_ttl(),
        }
    }
}

#[derive(Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "def_cache_ttl")]
    pub ttl: f64,
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.ttl)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: false,
            ttl: def_cache_ttl(),
        }
    }
}

/// Token-bucket settings shared by the read and write paths.
#[derive(Deserialize, Clone, Copy)]
pub struct LimiterSettings {
    /// Tokens added per second.
    pub rate: f64,

    /// Bucket capacity. Zero falls back to the rate.
    #[serde(default)]
    pub burst: usize,
}

#[derive(Deserialize, Default)]
pub struct DynamicRegistration {
    #[serde(default)]
    pub policy: String,

    #[serde(default)]
    pub config: Vec<toml::value::Table>,
}

/// One prototype block from a device config file, with the instances
/// built from it.
#[derive(Deserialize, Clone, Default)]
pub struct DeviceProto {
    #[serde(rename = "type", default)]
    pub device_type: String,

    #[serde(default)]
    pub handler: String,

    #[serde(default)]
    pub data: toml::value::Table,

    #[serde(default)]
    pub context: HashMap<String, String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub transforms: Vec<TransformConfig>,

    /// Seconds. Unset means the framework default.
    pub write_timeout: Option<f64>,

    #[serde(default)]
    pub instances: Vec<DeviceInstance>,
}

#[derive(Deserialize, Clone, Default)]
pub struct DeviceInstance {
    #[serde(rename = "type")]
    pub device_type: Option<String>,

    #[serde(default)]
    pub info: String,

    pub handler: Option<String>,

    #[serde(default)]
    pub data: toml::value::Table,

    #[serde(default)]
    pub context: HashMap<String, String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// A literal name, or a template over the built device
    /// (`{{ device.type }}`, `{{ device.id }}`, `{{ env "X" }}`).
    pub alias: Option<String>,

    #[serde(default)]
    pub sort_index: i32,

    /// Reading kind stamped onto untyped readings.
    pub output: Option<String>,

    pub write_timeout: Option<f64>,

    #[serde(default)]
    pub transforms: Vec<TransformConfig>,

    /// When set, the instance takes nothing from its prototype
    /// except tags, data, and context merging.
    #[serde(default)]
    pub disable_inheritance: bool,
}

/// One step of a transform chain as it appears in configuration.
/// Exactly one of `scale` and `apply` must be set.
#[derive(Deserialize, Clone, Default)]
pub struct TransformConfig {
    pub scale: Option<toml::Value>,
    pub apply: Option<String>,
}

impl TransformConfig {
    /// Validates the entry and builds the runtime transform.
    pub fn build(&self) -> Result<manifold_api::transform::Transform> {
        use manifold_api::transform::{Conversion, Transform};

        match (&self.scale, &self.apply) {
            (Some(_), Some(_)) => Err(Error::Config(
                "transform sets both scale and apply".into(),
            )),
            (None, None) => Err(Error::Config(
                "transform sets neither scale nor apply".into(),
            )),
            (Some(scale), None) => {
                let factor = match scale {
                    toml::Value::Integer(v) => *v as f64,
                    toml::Value::Float(v) => *v,
                    toml::Value::String(v) => {
                        v.parse::<f64>().map_err(|_| {
                            Error::Config(format!(
                                "can't parse scale factor \"{}\"",
                                v
                            ))
                        })?
                    }
                    _ => {
                        return Err(Error::Config(
                            "scale factor must be a number".into(),
                        ))
                    }
                };

                Ok(Transform::Scale(factor))
            }
            (None, Some(name)) => {
                Conversion::from_name(name).map(Transform::Apply)
            }
        }
    }
}

/// A device config file: a list of prototypes.
#[derive(Deserialize, Default)]
pub struct DeviceConfig {
    #[serde(default)]
    pub devices: Vec<DeviceProto>,
}

/// A type config file: output type definitions beyond the built-in
/// set.
#[derive(Deserialize, Default)]
pub struct TypeConfig {
    #[serde(default)]
    pub types: Vec<OutputTypeConfig>,
}

#[derive(Deserialize, Clone, Default)]
pub struct OutputTypeConfig {
    pub name: String,

    pub unit: Option<UnitConfig>,

    /// Decimal places applied to float readings of this type.
    pub precision: Option<i32>,
}

#[derive(Deserialize, Clone, Default)]
pub struct UnitConfig {
    pub name: String,

    #[serde(default)]
    pub symbol: String,
}

// ---------------------------------------------------------------------
// File loading.

const CFG_FILE: &str = "config.toml";
const SEARCH_DIRS: &[&str] = &[".", "./config", "/etc/synse/plugin/config"];

fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents)
        .map_err(|e| Error::Config(format!("{}", e)))
        .and_then(|cfg: Config| cfg.validate().map(|_| cfg))
}

async fn from_file(path: &Path) -> Option<Result<Config>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);

        Some(parse_config(&contents))
    } else {
        None
    }
}

/// Finds and parses the plugin configuration. The `PLUGIN_CONFIG`
/// environment variable names an explicit file and wins over the
/// search path; a named file that is missing or bad is an error,
/// while an exhausted search path yields the default configuration.
pub async fn load() -> Result<Config> {
    if let Ok(path) = env::var("PLUGIN_CONFIG") {
        return match from_file(Path::new(&path)).await {
            Some(result) => result,
            None => Err(Error::Config(format!(
                "PLUGIN_CONFIG file \"{}\" can't be read",
                path
            ))),
        };
    }

    for dir in SEARCH_DIRS {
        let file = Path::new(dir).join(CFG_FILE);

        if let Some(cfg) = from_file(&file).await {
            return cfg;
        }
    }
    Ok(Config::default())
}

// Gathers the TOML files of a directory in name order so device
// construction is deterministic across runs.

async fn toml_files(dir: &Path) -> Vec<PathBuf> {
    use tokio::fs;

    let mut found = vec![];

    if let Ok(mut entries) = fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();

            if path.extension().map(|v| v == "toml").unwrap_or(false) {
                found.push(path)
            }
        }
    }
    found.sort();
    found
}

// Shared loader for the device and type config families: an
// environment variable naming a file or directory wins over the
// mirrored search-path subdirectories. Finding nothing at all is
// fine.

async fn load_config_dir<T>(env_var: &str, subdir: &str) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
{
    use tokio::fs;

    let parse = |contents: &[u8], origin: &Path| -> Result<T> {
        toml::from_str(&String::from_utf8_lossy(contents)).map_err(|e| {
            Error::Config(format!("{}: {}", origin.display(), e))
        })
    };

    let mut dirs: Vec<PathBuf> = vec![];

    if let Ok(path) = env::var(env_var) {
        let path = PathBuf::from(&path);

        if path.is_file() {
            let contents = fs::read(&path).await.map_err(|e| {
                Error::Config(format!("{}: {}", path.display(), e))
            })?;

            return parse(&contents, &path).map(|cfg| vec![cfg]);
        }
        dirs.push(path)
    } else {
        dirs.extend(
            SEARCH_DIRS[1..].iter().map(|dir| Path::new(dir).join(subdir)),
        )
    }

    let mut configs = vec![];

    for dir in dirs {
        for file in toml_files(&dir).await {
            let contents = fs::read(&file).await.map_err(|e| {
                Error::Config(format!("{}: {}", file.display(), e))
            })?;

            configs.push(parse(&contents, &file)?)
        }
    }
    Ok(configs)
}

/// Finds and parses every device configuration file. The
/// `PLUGIN_DEVICE_CONFIG` environment variable may name a file or a
/// directory and wins over the search path (`./config/device`,
/// `/etc/synse/plugin/config/device`). No files at all is fine;
/// dynamic registration may be the only device source.
pub async fn load_devices() -> Result<Vec<DeviceConfig>> {
    load_config_dir("PLUGIN_DEVICE_CONFIG", "device").await
}

/// Finds and parses every type configuration file, mirroring the
/// device config search (`PLUGIN_TYPE_CONFIG`, `type/` subdirs).
pub async fn load_types() -> Result<Vec<TypeConfig>> {
    load_config_dir("PLUGIN_TYPE_CONFIG", "type").await
}

// ---------------------------------------------------------------------
// Command line.

/// Flags the core observes. The full argument surface belongs to the
/// embedding plugin; these are the ones the framework acts on.
#[derive(Debug, Default, Clone)]
pub struct CmdlineArgs {
    pub debug: bool,
    pub version: bool,
    pub dry_run: bool,
}

pub fn from_cmdline() -> CmdlineArgs {
    use clap::{crate_version, Arg, ArgAction, Command};

    let matches = Command::new("Manifold plugin")
        .version(crate_version!())
        .about("A device plugin built on the Manifold framework.")
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Run with debug logging"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .action(ArgAction::SetTrue)
                .help("Print version information and exit"),
        )
        .arg(
            Arg::new("dry_run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Perform setup, report any failure, and exit"),
        )
        .get_matches();

    CmdlineArgs {
        debug: matches.get_flag("debug"),
        version: matches.get_flag("version"),
        dry_run: matches.get_flag("dry_run"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();

        assert_eq!(cfg.get_log_level(), Level::WARN);
        assert!(cfg.id.is_none());
        assert_eq!(cfg.network.address, "0.0.0.0:5001");
        assert_eq!(cfg.network.network_type, "tcp");
        assert!(cfg.network.tls.is_none());
        assert_eq!(cfg.settings.mode().unwrap(), Mode::Serial);
        assert_eq!(cfg.settings.read.interval(), Duration::from_secs(1));
        assert_eq!(cfg.settings.read.buffer, 100);
        assert!(!cfg.settings.read.disable);
        assert_eq!(cfg.settings.write.interval(), Duration::from_secs(1));
        assert_eq!(cfg.settings.write.buffer, 100);
        assert_eq!(cfg.settings.write.max, 100);
        assert_eq!(cfg.settings.transaction.ttl(), Duration::from_secs(300));
        assert!(!cfg.settings.cache.enabled);
        assert_eq!(cfg.settings.cache.ttl(), Duration::from_secs(180));
        assert!(cfg.settings.limiter.is_none());
        assert!(cfg.dynamic_registration.policy.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse() {
        let cfg: Config = toml::from_str(
            r#"
id = "example-plugin"
log_level = "debug"

[network]
address = "127.0.0.1:6000"
type = "tcp"

[settings]
mode = "parallel"

[settings.read]
interval = 0.25
buffer = 10

[settings.write]
interval = 2.0
max = 5

[settings.limiter]
rate = 50.0
burst = 10

[dynamic_registration]
policy = "required"
config = [ { address = "10.0.0.1" }, { address = "10.0.0.2" } ]
"#,
        )
        .unwrap();

        assert_eq!(cfg.get_log_level(), Level::DEBUG);
        assert_eq!(cfg.id.as_deref(), Some("example-plugin"));
        assert_eq!(cfg.network.address, "127.0.0.1:6000");
        assert_eq!(cfg.settings.mode().unwrap(), Mode::Parallel);
        assert_eq!(cfg.settings.read.interval(), Duration::from_millis(250));
        assert_eq!(cfg.settings.read.buffer, 10);
        assert_eq!(cfg.settings.write.interval(), Duration::from_secs(2));
        assert_eq!(cfg.settings.write.max, 5);
        assert_eq!(cfg.settings.write.buffer, 100);

        let limiter = cfg.settings.limiter.unwrap();

        assert_eq!(limiter.rate, 50.0);
        assert_eq!(limiter.burst, 10);

        assert_eq!(cfg.dynamic_registration.policy, "required");
        assert_eq!(cfg.dynamic_registration.config.len(), 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let cfg: Config = toml::from_str(
            r#"
[settings]
mode = "sideways"

[settings.read]
buffer = 0

[settings.write]
buffer = 0
max = 0
"#,
        )
        .unwrap();

        match cfg.validate() {
            Err(Error::Config(msg)) => {
                assert!(msg.contains("4 error(s)"));
                assert!(msg.contains("unknown scheduler mode"));
                assert!(msg.contains("read buffer"));
                assert!(msg.contains("write buffer"));
                assert!(msg.contains("write max"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let cfg: Config = toml::from_str(
            r#"
[settings.limiter]
rate = 0.0
"#,
        )
        .unwrap();

        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_device_config() {
        let cfg: DeviceConfig = toml::from_str(
            r#"
[[devices]]
type = "temperature"
handler = "modbus"
tags = ["vapor/sensor"]
write_timeout = 5.0

[devices.data]
port = 502

[[devices.transforms]]
scale = "1e-3"

[[devices.instances]]
info = "CEC temperature 1"
alias = "cec-temp-1"
sort_index = 2

[devices.instances.data]
address = "10.0.0.1"

[[devices.instances]]
info = "CEC temperature 2"
disable_inheritance = true
"#,
        )
        .unwrap();

        assert_eq!(cfg.devices.len(), 1);

        let proto = &cfg.devices[0];

        assert_eq!(proto.device_type, "temperature");
        assert_eq!(proto.handler, "modbus");
        assert_eq!(proto.tags, vec![String::from("vapor/sensor")]);
        assert_eq!(proto.write_timeout, Some(5.0));
        assert_eq!(proto.data.get("port"), Some(&toml::Value::Integer(502)));
        assert_eq!(proto.instances.len(), 2);

        let inst = &proto.instances[0];

        assert_eq!(inst.info, "CEC temperature 1");
        assert_eq!(inst.alias.as_deref(), Some("cec-temp-1"));
        assert_eq!(inst.sort_index, 2);
        assert!(!inst.disable_inheritance);

        assert!(proto.instances[1].disable_inheritance);
    }

    #[test]
    fn test_type_config() {
        let cfg: TypeConfig = toml::from_str(
            r#"
[[types]]
name = "flow"
precision = 3

[types.unit]
name = "cubic feet per minute"
symbol = "CFM"

[[types]]
name = "lock-state"
"#,
        )
        .unwrap();

        assert_eq!(cfg.types.len(), 2);
        assert_eq!(cfg.types[0].name, "flow");
        assert_eq!(cfg.types[0].precision, Some(3));
        assert_eq!(cfg.types[0].unit.as_ref().unwrap().symbol, "CFM");
        assert_eq!(cfg.types[1].name, "lock-state");
        assert!(cfg.types[1].unit.is_none());
    }

    #[test]
    fn test_transform_config() {
        use manifold_api::transform::{Conversion, Transform};

        let t = TransformConfig {
            scale: Some(toml::Value::Float(0.5)),
            apply: None,
        };

        assert_eq!(t.build().unwrap(), Transform::Scale(0.5));

        let t = TransformConfig {
            scale: Some(toml::Value::Integer(3)),
            apply: None,
        };

        assert_eq!(t.build().unwrap(), Transform::Scale(3.0));

        let t = TransformConfig {
            scale: Some(toml::Value::String("1e-3".into())),
            apply: None,
        };

        assert_eq!(t.build().unwrap(), Transform::Scale(0.001));

        let t = TransformConfig {
            scale: None,
            apply: Some("FtoC".into()),
        };

        assert_eq!(t.build().unwrap(), Transform::Apply(Conversion::FtoC));

        // Both, neither, and malformed entries.

        assert!(TransformConfig {
            scale: Some(toml::Value::Float(1.0)),
            apply: Some("FtoC".into()),
        }
        .build()
        .is_err());

        assert!(TransformConfig::default().build().is_err());

        assert!(TransformConfig {
            scale: Some(toml::Value::String("fast".into())),
            apply: None,
        }
        .build()
        .is_err());

        assert!(TransformConfig {
            scale: Some(toml::Value::Boolean(true)),
            apply: None,
        }
        .build()
        .is_err());

        assert!(TransformConfig {
            scale: None,
            apply: Some("NoSuchConversion".into()),
        }
        .build()
        .is_err());
    }
}
