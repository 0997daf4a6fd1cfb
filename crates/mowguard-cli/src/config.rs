//! Configuration – reads/writes `~/.mowguard/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mowguard_kernel::{BladeAuthorization, BladeGrant, SafetyThresholds, SpeedCaps, WatchdogConfig};
use mowguard_middleware::BridgeConfig;
use mowguard_runtime::{CoreConfig, SafetyLoopConfig, SupervisedComponent, WatchdogTaskConfig};
use mowguard_types::MowError;
use serde::{Deserialize, Serialize};

/// Watchdog section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub grace_secs: u64,
    pub default_window_ms: u64,
    pub check_interval_ms: u64,
    pub self_pulse_ms: u64,
    pub supervised: Vec<SupervisedComponent>,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            grace_secs: 180,
            default_window_ms: 5_000,
            check_interval_ms: 500,
            self_pulse_ms: 2_000,
            supervised: Vec::new(),
        }
    }
}

/// Push-channel section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub session_queue_capacity: usize,
    pub idle_timeout_secs: u64,
    pub max_actions_per_second: u32,
}

impl Default for BridgeSection {
    fn default() -> Self {
        let d = BridgeConfig::default();
        Self {
            session_queue_capacity: d.session_queue_capacity,
            idle_timeout_secs: d.idle_timeout.as_secs(),
            max_actions_per_second: d.max_actions_per_second,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicAlias {
    pub canonical: String,
    pub alias: String,
}

/// A blade authorization token. The token itself never appears in `Debug`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct BladeToken {
    pub token: String,
    pub operator: String,
    #[serde(default)]
    pub allow_while_driving: bool,
}

impl std::fmt::Debug for BladeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BladeToken")
            .field("token", &"<redacted>")
            .field("operator", &self.operator)
            .field("allow_while_driving", &self.allow_while_driving)
            .finish()
    }
}

/// Persisted configuration stored in `~/.mowguard/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket port of the push channel.
    #[serde(default = "default_bridge_port")]
    pub bridge_port: u16,

    /// HTTP port of the control surface.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Safety loop period in milliseconds (50–1000).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Quality multiplier applied on each producer transport error.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f32,

    /// SQLite audit journal. In memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,

    #[serde(default)]
    pub thresholds: SafetyThresholds,

    #[serde(default)]
    pub speed_caps: SpeedCapsSection,

    #[serde(default)]
    pub watchdog: WatchdogSection,

    #[serde(default)]
    pub bridge: BridgeSection,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<TopicAlias>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blade_tokens: Vec<BladeToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedCapsSection {
    pub max_linear: f32,
    pub max_angular: f32,
}

impl Default for SpeedCapsSection {
    fn default() -> Self {
        let caps = SpeedCaps::default();
        Self {
            max_linear: caps.max_linear,
            max_angular: caps.max_angular,
        }
    }
}

fn default_bridge_port() -> u16 {
    9090
}
fn default_control_port() -> u16 {
    8080
}
fn default_tick_ms() -> u64 {
    250
}
fn default_bus_capacity() -> usize {
    256
}
fn default_decay_factor() -> f32 {
    mowguard_middleware::ingest::DEFAULT_DECAY_FACTOR
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_port: default_bridge_port(),
            control_port: default_control_port(),
            tick_ms: default_tick_ms(),
            bus_capacity: default_bus_capacity(),
            decay_factor: default_decay_factor(),
            journal_path: None,
            thresholds: SafetyThresholds::default(),
            speed_caps: SpeedCapsSection::default(),
            watchdog: WatchdogSection::default(),
            bridge: BridgeSection::default(),
            aliases: Vec::new(),
            blade_tokens: Vec::new(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> MowError {
    MowError::Config(msg.into())
}

impl Config {
    /// Reject values the safety core cannot run with.
    pub fn validate(&self) -> Result<(), MowError> {
        if !(50..=1000).contains(&self.tick_ms) {
            return Err(invalid(format!("tick_ms must be within 50..=1000, got {}", self.tick_ms)));
        }
        if self.bridge_port == self.control_port {
            return Err(invalid("bridge_port and control_port must differ"));
        }
        if self.bus_capacity == 0 || self.bridge.session_queue_capacity == 0 {
            return Err(invalid("queue capacities must be positive"));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            return Err(invalid(format!("decay_factor must be within (0, 1], got {}", self.decay_factor)));
        }
        if self.bridge.max_actions_per_second == 0 {
            return Err(invalid("bridge.max_actions_per_second must be positive"));
        }
        let t = &self.thresholds;
        if t.min_clearance_m > t.warn_clearance_m {
            return Err(invalid("thresholds.min_clearance_m must not exceed warn_clearance_m"));
        }
        if t.battery_critical_percent > t.battery_warning_percent {
            return Err(invalid(
                "thresholds.battery_critical_percent must not exceed battery_warning_percent",
            ));
        }
        if !(0.0..=1.0).contains(&t.quality_threshold) {
            return Err(invalid("thresholds.quality_threshold must be within [0, 1]"));
        }
        if self.speed_caps.max_linear <= 0.0 || self.speed_caps.max_angular <= 0.0 {
            return Err(invalid("speed caps must be positive"));
        }
        if let Some(c) = self.watchdog.supervised.iter().find(|c| c.window.is_zero()) {
            return Err(invalid(format!("watchdog window of {} must be positive", c.id)));
        }
        if self.blade_tokens.iter().any(|t| t.token.is_empty()) {
            return Err(invalid("blade tokens must not be empty"));
        }
        Ok(())
    }

    /// Runtime configuration of the safety core.
    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            bus_capacity: self.bus_capacity,
            aliases: self
                .aliases
                .iter()
                .map(|a| (a.canonical.clone(), a.alias.clone()))
                .collect(),
            decay_factor: self.decay_factor,
            safety: SafetyLoopConfig {
                tick_interval: Duration::from_millis(self.tick_ms),
                thresholds: self.thresholds.clone(),
                watchdog_window: Duration::from_millis(self.watchdog.self_pulse_ms.saturating_mul(3)),
            },
            watchdog: WatchdogTaskConfig {
                watchdog: WatchdogConfig {
                    grace_period: Duration::from_secs(self.watchdog.grace_secs),
                    default_window: Duration::from_millis(self.watchdog.default_window_ms),
                },
                check_interval: Duration::from_millis(self.watchdog.check_interval_ms),
                self_pulse_interval: Duration::from_millis(self.watchdog.self_pulse_ms),
                supervised: self.watchdog.supervised.clone(),
            },
            bridge: BridgeConfig {
                session_queue_capacity: self.bridge.session_queue_capacity,
                idle_timeout: Duration::from_secs(self.bridge.idle_timeout_secs),
                max_actions_per_second: self.bridge.max_actions_per_second,
            },
            journal_path: self.journal_path.clone(),
        }
    }

    pub fn speed_caps(&self) -> SpeedCaps {
        SpeedCaps {
            max_linear: self.speed_caps.max_linear,
            max_angular: self.speed_caps.max_angular,
        }
    }

    pub fn blade_authorization(&self) -> BladeAuthorization {
        let mut auth = BladeAuthorization::new();
        for t in &self.blade_tokens {
            auth.grant(
                &t.token,
                BladeGrant {
                    operator: t.operator.clone(),
                    allow_while_driving: t.allow_while_driving,
                },
            );
        }
        auth
    }
}

/// Return the path to `~/.mowguard/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mowguard").join("config.toml")
}

/// Load, apply env overrides and validate. `None` if the file is missing.
pub fn load() -> Result<Option<Config>, MowError> {
    let Some(mut cfg) = load_from(&config_path())? else {
        return Ok(None);
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, MowError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| invalid(format!("failed to read config at {}: {e}", path.display())))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| invalid(format!("failed to parse config: {e}")))?;
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `MOWGUARD_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MOWGUARD_BRIDGE_PORT` | `bridge_port` |
/// | `MOWGUARD_CONTROL_PORT` | `control_port` |
/// | `MOWGUARD_TICK_MS` | `tick_ms` |
/// | `MOWGUARD_JOURNAL_PATH` | `journal_path` |
/// | `MOWGUARD_MAX_TILT_DEG` | `thresholds.max_tilt_deg` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MOWGUARD_BRIDGE_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.bridge_port = port;
    }
    if let Ok(v) = std::env::var("MOWGUARD_CONTROL_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.control_port = port;
    }
    if let Ok(v) = std::env::var("MOWGUARD_TICK_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.tick_ms = ms;
    }
    if let Ok(v) = std::env::var("MOWGUARD_JOURNAL_PATH")
        && !v.is_empty()
    {
        cfg.journal_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("MOWGUARD_MAX_TILT_DEG")
        && let Ok(deg) = v.parse::<f32>()
    {
        cfg.thresholds.max_tilt_deg = deg;
    }
}

/// Save the config to disk, creating `~/.mowguard/` if necessary.
pub fn save(cfg: &Config) -> Result<(), MowError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), MowError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| invalid(format!("failed to create config directory: {e}")))?;
        // Owner only (rwx------).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| invalid(format!("failed to set config directory permissions: {e}")))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| invalid(format!("failed to serialize config: {e}")))?;
    // Tokens live in this file: rw------- on Unix.
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
            .map_err(|e| invalid(format!("failed to write config at {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| invalid(format!("failed to write config at {}: {e}", path.display())))?;
    Ok(())
}
