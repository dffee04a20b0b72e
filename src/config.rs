//! Site and tank configuration loaded once per boot from `tanksmoncfg.json`.
//!
//! The document is read into a bounded buffer, parsed into a JSON tree and
//! then walked field by field so that a missing or mistyped key is reported
//! with its name and tank index instead of silently becoming zero.

use serde::Serialize;
use serde_json::{Map, Value};
use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONFIG_FILE_NAME: &str = "tanksmoncfg.json";

/// Hard ceiling on the configuration document size, in bytes.
pub const MAX_CONFIG_BYTES: usize = 4000;

/// Number of JSON values the parser may hold for one document.
pub const MAX_JSON_NODES: usize = 512;

/// Largest tank table a single node will allocate.
pub const MAX_TANKS: usize = 8;

pub const DEFAULT_LO_ALARM_FACTOR: f32 = 0.10;
pub const DEFAULT_HI_ALARM_FACTOR: f32 = 1.10;
pub const DEFAULT_TANK_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;
pub const DEFAULT_NTP_SERVER: &str = "us.pool.ntp.org";
pub const DEFAULT_NTP_SYNC_SECS: u64 = 300;
pub const DEFAULT_SEND_DATA_DELAY_MS: u64 = 30_000;
pub const DEFAULT_PING_DELAY_MS: u64 = 5000;
pub const DEFAULT_AVG_WINDOW: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("storage unavailable at {0}")]
    StorageUnavailable(PathBuf),
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("config document is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: usize },
    #[error("config document malformed ({reason}): {detail}")]
    Malformed { reason: MalformedReason, detail: String },
    #[error("missing or mistyped field `{key}`{}", tank_suffix(.tank))]
    MissingField { key: &'static str, tank: Option<usize> },
    #[error("invalid field `{key}`{}: {reason}", tank_suffix(.tank))]
    InvalidField {
        key: &'static str,
        tank: Option<usize>,
        reason: String,
    },
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
}

fn tank_suffix(tank: &Option<usize>) -> String {
    match tank {
        Some(t) => format!(" in tankdefs[{t}]"),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    InvalidSyntax,
    NoMemory,
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedReason::InvalidSyntax => f.write_str("invalid input"),
            MalformedReason::NoMemory => f.write_str("not enough memory"),
        }
    }
}

/// What to do when a required key is absent or has the wrong JSON type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingFieldPolicy {
    /// Refuse to boot.
    #[default]
    FailFast,
    /// Substitute the documented default and log a warning.
    Defaults,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub ssid: String,
    #[serde(skip_serializing)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub data_topic: String,
    pub control_topic: String,
}

/// Bounded retry behaviour shared by the link and session supervisors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub retry_limit: u32,
    pub delay: Duration,
    pub reboot_on_exhaustion: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_COUNT,
            delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            reboot_on_exhaustion: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteConfig {
    pub sitename: String,
    pub primary: Credentials,
    pub alternate: Option<Credentials>,
    /// Fixed UTC offset in hours.
    pub timezone: i32,
    pub dst: bool,
    pub broker: BrokerConfig,
    pub imperial: bool,
    pub use_avg: bool,
    pub avg_window: usize,
    pub debug: bool,
    pub ping_interval: Duration,
    pub report_interval: Duration,
    #[serde(skip_serializing)]
    pub ota_password: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub num_tanks: usize,
    pub starting_tank: u32,
    pub wifi_retry: RetryPolicy,
    pub mqtt_retry: RetryPolicy,
    pub ntp_server: String,
    pub ntp_sync_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TankKind {
    Water,
    Propane,
    Other(String),
}

impl TankKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim() {
            "W" | "w" | "water" | "Water" => TankKind::Water,
            "P" | "p" | "propane" | "Propane" => TankKind::Propane,
            other => TankKind::Other(other.to_string()),
        }
    }

    /// Single-letter tag used on the wire.
    pub fn as_tag(&self) -> &str {
        match self {
            TankKind::Water => "W",
            TankKind::Propane => "P",
            TankKind::Other(tag) => tag,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TankConfig {
    pub kind: TankKind,
    pub ignore: bool,
    /// Sensor-to-bottom distance of an empty tank, cm.
    pub depth: f32,
    /// Liters per cm of liquid height.
    pub vcm: f32,
    pub sensor_offset: f32,
    pub trig_pin: u32,
    pub echo_pin: u32,
    pub lo_alarm_factor: f32,
    pub hi_alarm_factor: f32,
    pub lo_alarm: f32,
    pub hi_alarm: f32,
    pub timeout: Duration,
    pub pump_node: i64,
    pub pump_number: u32,
}

/// Loads the boot configuration from a storage root directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
    policy: MissingFieldPolicy,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            policy: MissingFieldPolicy::default(),
        }
    }

    /// Storage root from `CONFIG_DIR`, policy from `TANKMON_CONFIG_DEFAULTS`.
    pub fn from_env() -> Self {
        let root = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        let policy = if get_env_flag("TANKMON_CONFIG_DEFAULTS") {
            MissingFieldPolicy::Defaults
        } else {
            MissingFieldPolicy::FailFast
        };
        Self::new(root).with_policy(policy)
    }

    pub fn with_policy(mut self, policy: MissingFieldPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn load(&self) -> Result<(SiteConfig, Vec<TankConfig>), ConfigError> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(ConfigError::StorageUnavailable(self.root.clone())),
        }
        debug!(root = %self.root.display(), "storage mounted");

        let path = self.config_path();
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound(path));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();

        let mut buf = Vec::with_capacity(MAX_CONFIG_BYTES);
        file.take(MAX_CONFIG_BYTES as u64 + 1).read_to_end(&mut buf)?;
        if buf.len() > MAX_CONFIG_BYTES {
            return Err(ConfigError::TooLarge {
                size: size.max(buf.len() as u64),
                limit: MAX_CONFIG_BYTES,
            });
        }
        info!(path = %path.display(), size = buf.len(), "opened config file");

        let (site, tanks) = parse_document(&buf, self.policy)?;
        info!(
            site = %site.sitename,
            tanks = tanks.len(),
            starting_tank = site.starting_tank,
            "config loaded"
        );
        Ok((site, tanks))
    }
}

/// Parses and validates a configuration document held in memory.
pub fn parse_document(
    bytes: &[u8],
    policy: MissingFieldPolicy,
) -> Result<(SiteConfig, Vec<TankConfig>), ConfigError> {
    let doc: Value = serde_json::from_slice(bytes).map_err(|e| ConfigError::Malformed {
        reason: MalformedReason::InvalidSyntax,
        detail: e.to_string(),
    })?;
    let nodes = count_nodes(&doc);
    if nodes > MAX_JSON_NODES {
        return Err(ConfigError::Malformed {
            reason: MalformedReason::NoMemory,
            detail: format!("{nodes} values exceed the {MAX_JSON_NODES} value budget"),
        });
    }

    let site_obj = doc
        .get("site")
        .and_then(Value::as_object)
        .ok_or(ConfigError::MissingField {
            key: "site",
            tank: None,
        })?;
    let site = parse_site(&Fields::new(site_obj, None, policy))?;

    let defs = doc
        .get("tankdefs")
        .and_then(Value::as_array)
        .ok_or(ConfigError::MissingField {
            key: "tankdefs",
            tank: None,
        })?;

    let mut tanks = Vec::with_capacity(site.num_tanks);
    for t in 0..site.num_tanks {
        let obj = defs
            .get(t)
            .and_then(Value::as_object)
            .ok_or(ConfigError::MissingField {
                key: "tankdefs",
                tank: Some(t),
            })?;
        tanks.push(parse_tank(&Fields::new(obj, Some(t), policy))?);
    }

    Ok((site, tanks))
}

fn parse_site(f: &Fields<'_>) -> Result<SiteConfig, ConfigError> {
    let num_tanks = f.int("numtanks", 1)?;
    if num_tanks < 1 || num_tanks > MAX_TANKS as i64 {
        return Err(f.invalid(
            "numtanks",
            format!("must be between 1 and {MAX_TANKS}, got {num_tanks}"),
        ));
    }
    let starting_tank = f.int("startingTankNum", 0)?;
    let starting_tank = u32::try_from(starting_tank).map_err(|_| {
        f.invalid("startingTankNum", format!("must be between 0 and {}, got {starting_tank}", u32::MAX))
    })?;
    let port = f.int("mqtt_port", 1883)?;
    let port = u16::try_from(port)
        .map_err(|_| f.invalid("mqtt_port", format!("{port} is not a TCP port")))?;

    let use_alt = f.opt_bool("usealtssid", false);
    let alt_ssid = f.opt_string("altssid", "");
    let alternate = (use_alt && !alt_ssid.is_empty()).then(|| Credentials {
        ssid: alt_ssid,
        password: f.opt_string("altpwd", ""),
    });

    let wifi_reboot = f.opt_bool("wifireboot", true);
    let ping_ms = f.uint("tankpingdelay", DEFAULT_PING_DELAY_MS)?;
    let ping_interval = f.interval_ms("tankpingdelay", ping_ms)?;
    let report_interval = f.interval_ms(
        "senddatadelay",
        f.opt_uint("senddatadelay", DEFAULT_SEND_DATA_DELAY_MS),
    )?;

    Ok(SiteConfig {
        sitename: f.string("sitename", "")?,
        primary: Credentials {
            ssid: f.string("pssid", "")?,
            password: f.string("ppwd", "")?,
        },
        alternate,
        timezone: f.int_i32("timezone", 0)?,
        dst: f.boolean("dst", false)?,
        broker: BrokerConfig {
            host: f.string("mqtt_server", "localhost")?,
            port,
            username: f.string("mqtt_uid", "")?,
            password: f.string("mqtt_pwd", "")?,
            data_topic: f.string("mqtt_topic_data", "tankmon/data")?,
            control_topic: f.string("mqtt_topic_ctrl", "tankmon/ctrl")?,
        },
        imperial: f.boolean("imperial", false)?,
        use_avg: f.boolean("useavg", false)?,
        avg_window: f.opt_uint("avgwindow", DEFAULT_AVG_WINDOW as u64).max(1) as usize,
        debug: f.boolean("debug", false)?,
        ping_interval,
        report_interval,
        ota_password: f.string("otapwd", "")?,
        auth_token: f.string("blynkauthtoken", "")?,
        num_tanks: num_tanks as usize,
        starting_tank,
        wifi_retry: RetryPolicy {
            retry_limit: u32::try_from(f.opt_uint("wifiretrycnt", DEFAULT_RETRY_COUNT as u64))
                .unwrap_or(u32::MAX),
            delay: Duration::from_millis(f.opt_uint("wifiretrydelay", DEFAULT_RETRY_DELAY_MS)),
            reboot_on_exhaustion: wifi_reboot,
        },
        mqtt_retry: RetryPolicy {
            retry_limit: u32::try_from(f.opt_uint("mqttretrycnt", DEFAULT_RETRY_COUNT as u64))
                .unwrap_or(u32::MAX),
            delay: Duration::from_millis(f.opt_uint("mqttretrydelay", DEFAULT_RETRY_DELAY_MS)),
            reboot_on_exhaustion: true,
        },
        ntp_server: f.opt_string("ntpserver", DEFAULT_NTP_SERVER),
        ntp_sync_interval: Duration::from_secs(
            f.opt_uint("ntpsyncinterval", DEFAULT_NTP_SYNC_SECS),
        ),
    })
}

fn parse_tank(f: &Fields<'_>) -> Result<TankConfig, ConfigError> {
    let depth = f.float("depth", 0.0)?;
    if !(depth > 0.0) {
        return Err(f.invalid("depth", format!("must be > 0, got {depth}")));
    }
    let vcm = f.float("vCM", 0.0)?;
    if !(vcm > 0.0) {
        return Err(f.invalid("vCM", format!("must be > 0, got {vcm}")));
    }
    let lo_alarm_factor = f.float("loAlarmFactor", DEFAULT_LO_ALARM_FACTOR)?;
    let hi_alarm_factor = f.float("hiAlarmFactor", DEFAULT_HI_ALARM_FACTOR)?;
    if !(lo_alarm_factor >= 0.0 && lo_alarm_factor < hi_alarm_factor) {
        return Err(f.invalid(
            "loAlarmFactor",
            format!("need 0 <= lo < hi, got lo={lo_alarm_factor} hi={hi_alarm_factor}"),
        ));
    }
    let timeout_secs = f.uint("timeout", DEFAULT_TANK_TIMEOUT_SECS)?;

    Ok(TankConfig {
        kind: TankKind::from_tag(&f.string("tankType", "W")?),
        ignore: f.boolean("ignore", false)?,
        depth,
        vcm,
        sensor_offset: f.float("sensorOffset", 0.0)?,
        trig_pin: f.uint_u32("sonarTrigPin", 0)?,
        echo_pin: f.uint_u32("sonarEchoPin", 0)?,
        lo_alarm_factor,
        hi_alarm_factor,
        lo_alarm: lo_alarm_factor * depth,
        hi_alarm: hi_alarm_factor * depth,
        timeout: Duration::from_millis(timeout_secs.saturating_mul(1000)),
        pump_node: f.int("pumpnode", 0)?,
        pump_number: f.uint_u32("pumpnumber", 0)?,
    })
}

/// Logs the loaded tank table at debug level.
pub fn dump_tanks(tanks: &[TankConfig]) {
    for (t, tank) in tanks.iter().enumerate() {
        debug!(
            tank = t,
            tank_type = tank.kind.as_tag(),
            ignore = tank.ignore,
            timeout_ms = tank.timeout.as_millis() as u64,
            sensor_offset = tank.sensor_offset,
            trig_pin = tank.trig_pin,
            echo_pin = tank.echo_pin,
            depth = tank.depth,
            vcm = tank.vcm,
            lo_alarm = tank.lo_alarm,
            hi_alarm = tank.hi_alarm,
            pump_node = tank.pump_node,
            pump_number = tank.pump_number,
            "tank definition"
        );
    }
}

fn count_nodes(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(count_nodes).sum::<usize>(),
        Value::Object(map) => 1 + map.values().map(count_nodes).sum::<usize>(),
        _ => 1,
    }
}

/// Typed accessors over one JSON object, applying the missing-field policy.
struct Fields<'a> {
    obj: &'a Map<String, Value>,
    tank: Option<usize>,
    policy: MissingFieldPolicy,
}

impl<'a> Fields<'a> {
    fn new(obj: &'a Map<String, Value>, tank: Option<usize>, policy: MissingFieldPolicy) -> Self {
        Self { obj, tank, policy }
    }

    fn invalid(&self, key: &'static str, reason: String) -> ConfigError {
        ConfigError::InvalidField {
            key,
            tank: self.tank,
            reason,
        }
    }

    fn required<T: std::fmt::Debug>(
        &self,
        key: &'static str,
        default: T,
        read: impl Fn(&Value) -> Option<T>,
    ) -> Result<T, ConfigError> {
        if let Some(v) = self.obj.get(key).and_then(&read) {
            return Ok(v);
        }
        match self.policy {
            MissingFieldPolicy::FailFast => Err(ConfigError::MissingField {
                key,
                tank: self.tank,
            }),
            MissingFieldPolicy::Defaults => {
                warn!(key, tank = ?self.tank, ?default, "config field missing, using default");
                Ok(default)
            }
        }
    }

    fn string(&self, key: &'static str, default: &str) -> Result<String, ConfigError> {
        self.required(key, default.to_string(), read_string)
    }

    fn float(&self, key: &'static str, default: f32) -> Result<f32, ConfigError> {
        self.required(key, default, |v| v.as_f64().map(|n| n as f32))
    }

    fn int(&self, key: &'static str, default: i64) -> Result<i64, ConfigError> {
        self.required(key, default, read_int)
    }

    fn uint(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        self.required(key, default, |v| read_int(v).and_then(|n| u64::try_from(n).ok()))
    }

    fn int_i32(&self, key: &'static str, default: i32) -> Result<i32, ConfigError> {
        let n = self.int(key, i64::from(default))?;
        i32::try_from(n).map_err(|_| self.invalid(key, format!("{n} is out of range")))
    }

    fn uint_u32(&self, key: &'static str, default: u32) -> Result<u32, ConfigError> {
        let n = self.uint(key, u64::from(default))?;
        u32::try_from(n).map_err(|_| self.invalid(key, format!("{n} is out of range")))
    }

    /// Timer periods must be non-zero.
    fn interval_ms(&self, key: &'static str, ms: u64) -> Result<Duration, ConfigError> {
        if ms == 0 {
            return Err(self.invalid(key, "must be > 0".to_string()));
        }
        Ok(Duration::from_millis(ms))
    }

    fn boolean(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        self.required(key, default, read_bool)
    }

    fn opt_string(&self, key: &str, default: &str) -> String {
        self.obj
            .get(key)
            .and_then(read_string)
            .unwrap_or_else(|| default.to_string())
    }

    fn opt_uint(&self, key: &str, default: u64) -> u64 {
        self.obj
            .get(key)
            .and_then(read_int)
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(default)
    }

    fn opt_bool(&self, key: &str, default: bool) -> bool {
        self.obj.get(key).and_then(read_bool).unwrap_or(default)
    }
}

fn read_string(v: &Value) -> Option<String> {
    v.as_str().map(str::to_string)
}

fn read_int(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| {
        v.as_f64()
            .filter(|n| n.fract() == 0.0 && n.is_finite())
            .map(|n| n as i64)
    })
}

// 0/1 is accepted for flags, as older site files wrote them that way.
fn read_bool(v: &Value) -> Option<bool> {
    v.as_bool().or_else(|| v.as_i64().map(|n| n != 0))
}

fn get_env_flag(key: &str) -> bool {
    env::var(key)
        .map(|val| val == "1" || val.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
