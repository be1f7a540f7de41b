//! Configuration Vault – reads/writes `~/.dynadev/config.toml`.
//!
//! The file also carries the static interface entries that are installed on
//! the device at startup, so [`Config`] is the device's
//! [`InterfaceSource`].

use dynadev_device::InterfaceSource;
use dynadev_kernel::GatePolicy;
use dynadev_types::{
    AttrAccess, AttributeDescriptor, CommandDescriptor, DataType, OperationKind, PipeDescriptor,
    PipeWriteType,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which example device the CLI serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    #[default]
    Ifchange,
    Pipe,
}

impl ServerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ifchange" => Some(ServerKind::Ifchange),
            "pipe" => Some(ServerKind::Pipe),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerKind::Ifchange => write!(f, "ifchange"),
            ServerKind::Pipe => write!(f, "pipe"),
        }
    }
}

/// `[guard]` table. Unset fields keep the device's own policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Operation kinds blocked while busy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gated: Option<Vec<OperationKind>>,

    /// Extra targets reachable while busy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exempt: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_command: Option<String>,
}

impl GuardConfig {
    pub fn apply(&self, mut policy: GatePolicy) -> GatePolicy {
        if let Some(gated) = &self.gated {
            policy.gated = gated.iter().copied().collect();
        }
        for target in &self.exempt {
            policy = policy.exempt(target);
        }
        if let Some(cmd) = &self.unlock_command {
            policy = policy.with_unlock_command(cmd);
        }
        policy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticAttribute {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_access")]
    pub access: AttrAccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticCommand {
    pub name: String,
    #[serde(default = "default_void")]
    pub in_type: DataType,
    #[serde(default = "default_void")]
    pub out_type: DataType,
    #[serde(default)]
    pub device_level: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticPipe {
    pub name: String,
    #[serde(default = "default_pipe_write_type")]
    pub write_type: PipeWriteType,
}

/// Persisted configuration stored in `~/.dynadev/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device name, e.g. "test/ifchange/1".
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default)]
    pub server: ServerKind,

    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,

    /// Heartbeat periods a subscriber may miss before it is evicted.
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    /// Per-subscriber event queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub guard: GuardConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<StaticAttribute>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<StaticCommand>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipes: Vec<StaticPipe>,
}

fn default_device_name() -> String {
    "test/ifchange/1".to_string()
}
fn default_heartbeat_period_ms() -> u64 {
    10_000
}
fn default_max_missed_heartbeats() -> u32 {
    dynadev_middleware::dispatcher::DEFAULT_MAX_MISSED_HEARTBEATS
}
fn default_queue_capacity() -> usize {
    dynadev_middleware::dispatcher::DEFAULT_QUEUE_CAPACITY
}
fn default_access() -> AttrAccess {
    AttrAccess::Read
}
fn default_void() -> DataType {
    DataType::Void
}
fn default_pipe_write_type() -> PipeWriteType {
    PipeWriteType::Read
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            server: ServerKind::default(),
            heartbeat_period_ms: default_heartbeat_period_ms(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            queue_capacity: default_queue_capacity(),
            guard: GuardConfig::default(),
            attributes: Vec::new(),
            commands: Vec::new(),
            pipes: Vec::new(),
        }
    }
}

impl Config {
    /// Reject values the heartbeat timer and the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_period_ms == 0 {
            return Err("Invalid config: heartbeat_period_ms must be greater than 0".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("Invalid config: queue_capacity must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }
}

impl InterfaceSource for Config {
    fn attributes(&self) -> Vec<AttributeDescriptor> {
        self.attributes
            .iter()
            .map(|a| AttributeDescriptor {
                name: a.name.clone(),
                data_type: a.data_type,
                access: a.access,
                is_dynamic: false,
            })
            .collect()
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        self.commands
            .iter()
            .map(|c| CommandDescriptor {
                name: c.name.clone(),
                in_type: c.in_type,
                out_type: c.out_type,
                takes_device_arg: c.device_level,
                is_dynamic: false,
            })
            .collect()
    }

    fn pipes(&self) -> Vec<PipeDescriptor> {
        self.pipes
            .iter()
            .map(|p| PipeDescriptor {
                name: p.name.clone(),
                write_type: p.write_type,
                is_dynamic: false,
            })
            .collect()
    }
}

/// Return the path to `~/.dynadev/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".dynadev").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path and apply environment overrides.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    let mut cfg = read_from(path)?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Parse the file at `path` without consulting the environment.
pub(crate) fn read_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `DYNADEV_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `DYNADEV_DEVICE_NAME` | `device_name` |
/// | `DYNADEV_SERVER` | `server` |
/// | `DYNADEV_HEARTBEAT_MS` | `heartbeat_period_ms` |
/// | `DYNADEV_QUEUE_CAPACITY` | `queue_capacity` |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("DYNADEV_DEVICE_NAME")
        && !v.trim().is_empty()
    {
        cfg.device_name = v;
    }
    if let Ok(v) = std::env::var("DYNADEV_SERVER")
        && let Some(kind) = ServerKind::from_name(&v)
    {
        cfg.server = kind;
    }
    if let Ok(v) = std::env::var("DYNADEV_HEARTBEAT_MS")
        && let Ok(ms) = v.parse::<u64>()
        && ms > 0
    {
        cfg.heartbeat_period_ms = ms;
    }
    if let Ok(v) = std::env::var("DYNADEV_QUEUE_CAPACITY")
        && let Ok(capacity) = v.parse::<usize>()
        && capacity > 0
    {
        cfg.queue_capacity = capacity;
    }
}

/// Save the config to disk, creating `~/.dynadev/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
