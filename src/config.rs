//! Provides the CLI option parser and the configuration file loader.
//!
//! Used to parse the argv/config file into an immutable `Config` that every
//! other component is handed by reference at startup.

use crate::queue::OverflowPolicy;
use crate::time::Backoff;
use clap::{App, Arg};
use std::env;
use std::error;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

/// Errors that make a configuration unusable. Always fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io(PathBuf, io::Error),
    /// The configuration file is not valid TOML.
    Parse(toml::de::Error),
    /// A required setting is absent.
    Missing(&'static str),
    /// A setting is present but has the wrong type or an unusable value.
    Invalid(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConfigError::Io(ref path, ref e) => {
                write!(f, "could not read {}: {}", path.display(), e)
            }
            ConfigError::Parse(ref e) => write!(f, "could not parse config file: {}", e),
            ConfigError::Missing(key) => write!(f, "{} must be set", key),
            ConfigError::Invalid(key, ref reason) => write!(f, "{} is invalid: {}", key, reason),
        }
    }
}

impl error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            ConfigError::Io(_, ref e) => Some(e),
            ConfigError::Parse(ref e) => Some(e),
            _ => None,
        }
    }
}

/// The kinds of host event that may be annotated, each gated by its own
/// toggle under `[graphite_event]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A health check failed.
    FailedCheck,
    /// Enough checks failed in a row to call it an outage.
    NewOutage,
    /// A service in outage passed a check.
    ServiceBack,
    /// A check passed but slower than the service's warning threshold.
    LatencyWarning,
}

impl EventKind {
    /// The toggle's key in the `[graphite_event]` table.
    pub fn key(&self) -> &'static str {
        match *self {
            EventKind::FailedCheck => "failedCheck",
            EventKind::NewOutage => "newOutage",
            EventKind::ServiceBack => "serviceBack",
            EventKind::LatencyWarning => "latencyWarning",
        }
    }

    /// The tag annotations of this kind carry.
    pub fn tag(&self) -> &'static str {
        match *self {
            EventKind::FailedCheck => "failed_check",
            EventKind::NewOutage => "new_outage",
            EventKind::ServiceBack => "service_back",
            EventKind::LatencyWarning => "latency_warning",
        }
    }
}

/// Which event kinds are annotated. All off by default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventToggles {
    /// `graphite_event.failedCheck`
    pub failed_check: bool,
    /// `graphite_event.newOutage`
    pub new_outage: bool,
    /// `graphite_event.serviceBack`
    pub service_back: bool,
    /// `graphite_event.latencyWarning`
    pub latency_warning: bool,
}

impl EventToggles {
    /// Whether annotations of `kind` are enabled.
    pub fn enabled(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::FailedCheck => self.failed_check,
            EventKind::NewOutage => self.new_outage,
            EventKind::ServiceBack => self.service_back,
            EventKind::LatencyWarning => self.latency_warning,
        }
    }

    /// Whether any annotation is enabled at all.
    pub fn any(&self) -> bool {
        self.failed_check || self.new_outage || self.service_back || self.latency_warning
    }

    fn set(&mut self, kind: EventKind, on: bool) {
        match kind {
            EventKind::FailedCheck => self.failed_check = on,
            EventKind::NewOutage => self.new_outage = on,
            EventKind::ServiceBack => self.service_back = on,
            EventKind::LatencyWarning => self.latency_warning = on,
        }
    }
}

/// graphite-web events API settings, the `[graphite_api]` table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApiConfig {
    /// Base URL of graphite-web. `/events/` is appended.
    pub url: Option<String>,
    /// Basic auth user. No `Authorization` header is sent when empty.
    pub user: String,
    /// Basic auth password.
    pub pass: String,
}

/// Runtime configuration for watchmen-graphite.
///
/// Built once by `load` or `parse_config` and never mutated after; share it
/// with `Arc<Config>` or `&Config`.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// The graphite relay's host. Required.
    pub host: String,
    /// The graphite relay's plaintext port.
    pub port: u16,
    /// Bounds a single connect attempt, every write, the idle period after
    /// which a quiet connection is closed and the final flush on shutdown.
    pub socket_timeout: Duration,
    /// The wait between reconnection attempts.
    pub reconnect_delay: Duration,
    /// How `reconnect_delay` grows across consecutive failures.
    pub reconnect_backoff: Backoff,
    /// The most samples held while graphite is unreachable.
    pub queue_size_limit: usize,
    /// The most samples written per batch.
    pub chunk_size: usize,
    /// The period of the flusher's tick.
    pub flush_interval: Duration,
    /// What gives way when the queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Prefix of every metric path.
    pub metric_prefix: String,
    /// See `ApiConfig`.
    pub api: ApiConfig,
    /// See `EventToggles`.
    pub events: EventToggles,
    /// The verbosity setting. The higher the value the more chatty we get.
    pub verbose: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: String::new(),
            port: 2003,
            socket_timeout: Duration::from_millis(300_000),
            reconnect_delay: Duration::from_millis(1_000),
            reconnect_backoff: Backoff::Fixed,
            queue_size_limit: 10_000_000,
            chunk_size: 200,
            flush_interval: Duration::from_millis(1_000),
            overflow_policy: OverflowPolicy::DropOldest,
            metric_prefix: "monitor.uptime".to_string(),
            api: ApiConfig::default(),
            events: EventToggles::default(),
            verbose: 0,
        }
    }
}

/// Parsed command line.
#[derive(Debug)]
pub struct Args {
    /// Path of the TOML configuration file.
    pub config_file: PathBuf,
    /// Number of `-v` flags given.
    pub verbose: u64,
}

/// Parse argv.
pub fn parse_args() -> Args {
    let args = App::new("watchmen-graphite")
        .version(VERSION.unwrap_or("unknown"))
        .about("ships watchmen health checks to graphite")
        .arg(
            Arg::with_name("config-file")
                .long("config")
                .short("C")
                .value_name("config")
                .required(true)
                .help("The config file to feed in.")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output."),
        )
        .get_matches();

    let verb = if args.is_present("verbose") {
        args.occurrences_of("verbose")
    } else {
        0
    };

    Args {
        // clap enforces `required(true)`
        config_file: PathBuf::from(args.value_of("config-file").unwrap_or_default()),
        verbose: verb,
    }
}

/// Read and parse the configuration file named in `args`, then apply
/// environment overrides.
pub fn load(args: &Args) -> Result<Config, ConfigError> {
    let mut buffer = String::new();
    File::open(&args.config_file)
        .and_then(|mut fp| fp.read_to_string(&mut buffer))
        .map_err(|e| ConfigError::Io(args.config_file.clone(), e))?;
    parse_config(&buffer, args.verbose, |key| env::var(key).ok())
}

/// Parse a configuration file without consulting the environment.
pub fn parse_config_file(buffer: &str, verbosity: u64) -> Result<Config, ConfigError> {
    parse_config(buffer, verbosity, |_| None)
}

/// Parse a configuration file, then apply overrides looked up through `env`.
///
/// Recognized overrides are `WATCHMEN_GRAPHITE_HOST`,
/// `WATCHMEN_GRAPHITE_PORT`, `WATCHMEN_GRAPHITE_API_URL`,
/// `WATCHMEN_GRAPHITE_API_USER` and `WATCHMEN_GRAPHITE_API_PASS`.
pub fn parse_config<F>(buffer: &str, verbosity: u64, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = Config::default();
    let value: toml::Value = toml::from_str(buffer).map_err(ConfigError::Parse)?;

    config.verbose = verbosity;

    if let Some(host) = string(&value, "graphite_host")? {
        config.host = host;
    }
    if let Some(port) = integer(&value, "graphite_port")? {
        config.port = port_number("graphite_port", port)?;
    }
    if let Some(ms) = integer(&value, "socket_timeout")? {
        config.socket_timeout = millis("socket_timeout", ms, 1)?;
    }
    if let Some(ms) = integer(&value, "socket_reconnect_delay")? {
        config.reconnect_delay = millis("socket_reconnect_delay", ms, 0)?;
    }
    if let Some(limit) = integer(&value, "queue_size_limit")? {
        config.queue_size_limit = count("queue_size_limit", limit)?;
    }
    if let Some(size) = integer(&value, "chunk_size")? {
        config.chunk_size = count("chunk_size", size)?;
    }
    if let Some(ms) = integer(&value, "flush_interval")? {
        config.flush_interval = millis("flush_interval", ms, 1)?;
    }
    if let Some(policy) = string(&value, "overflow_policy")? {
        config.overflow_policy = policy
            .parse()
            .map_err(|e| ConfigError::Invalid("overflow_policy", e))?;
    }
    if let Some(prefix) = string(&value, "metric_prefix")? {
        config.metric_prefix = prefix.trim_end_matches('.').to_string();
    }

    let max_delay = match integer(&value, "socket_reconnect_max_delay")? {
        Some(ms) => millis("socket_reconnect_max_delay", ms, 0)?,
        None => Duration::from_millis(60_000),
    };
    config.reconnect_backoff = match string(&value, "socket_reconnect_backoff")? {
        None => Backoff::Fixed,
        Some(ref s) if s == "fixed" => Backoff::Fixed,
        Some(ref s) if s == "exponential" => Backoff::Exponential { max: max_delay },
        Some(s) => {
            return Err(ConfigError::Invalid(
                "socket_reconnect_backoff",
                format!("expected 'fixed' or 'exponential', got '{}'", s),
            ))
        }
    };

    if let Some(api) = table(&value, "graphite_api")? {
        config.api.url = string(api, "url")?;
        config.api.user = string(api, "user")?.unwrap_or_default();
        config.api.pass = string(api, "pass")?.unwrap_or_default();
    }

    if let Some(events) = table(&value, "graphite_event")? {
        for kind in &[
            EventKind::FailedCheck,
            EventKind::NewOutage,
            EventKind::ServiceBack,
            EventKind::LatencyWarning,
        ] {
            match events.get(kind.key()) {
                None => {}
                Some(v) => match v.as_bool() {
                    Some(on) => config.events.set(*kind, on),
                    None => {
                        return Err(ConfigError::Invalid(
                            kind.key(),
                            "must be a boolean".to_string(),
                        ))
                    }
                },
            }
        }
    }

    if let Some(host) = env("WATCHMEN_GRAPHITE_HOST") {
        config.host = host;
    }
    if let Some(port) = env("WATCHMEN_GRAPHITE_PORT") {
        let port = port.trim().parse::<i64>().map_err(|e| {
            ConfigError::Invalid("WATCHMEN_GRAPHITE_PORT", e.to_string())
        })?;
        config.port = port_number("WATCHMEN_GRAPHITE_PORT", port)?;
    }
    if let Some(url) = env("WATCHMEN_GRAPHITE_API_URL") {
        config.api.url = Some(url);
    }
    if let Some(user) = env("WATCHMEN_GRAPHITE_API_USER") {
        config.api.user = user;
    }
    if let Some(pass) = env("WATCHMEN_GRAPHITE_API_PASS") {
        config.api.pass = pass;
    }

    validate(config)
}

fn validate(config: Config) -> Result<Config, ConfigError> {
    if config.host.trim().is_empty() {
        return Err(ConfigError::Missing("graphite_host"));
    }
    if config.chunk_size > config.queue_size_limit {
        return Err(ConfigError::Invalid(
            "chunk_size",
            format!(
                "{} is larger than queue_size_limit {}",
                config.chunk_size, config.queue_size_limit
            ),
        ));
    }
    match config.api.url {
        Some(ref url) => {
            Url::parse(url).map_err(|e| ConfigError::Invalid("graphite_api.url", e.to_string()))?;
        }
        None => {
            if config.events.any() {
                return Err(ConfigError::Missing("graphite_api.url"));
            }
        }
    }
    Ok(config)
}

fn string(value: &toml::Value, key: &'static str) -> Result<Option<String>, ConfigError> {
    match value.get(key) {
        None => Ok(None),
        Some(v) => v.as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| ConfigError::Invalid(key, "must be a string".to_string())),
    }
}

fn integer(value: &toml::Value, key: &'static str) -> Result<Option<i64>, ConfigError> {
    match value.get(key) {
        None => Ok(None),
        Some(v) => v.as_integer()
            .map(Some)
            .ok_or_else(|| ConfigError::Invalid(key, "must be an integer".to_string())),
    }
}

fn table<'a>(
    value: &'a toml::Value,
    key: &'static str,
) -> Result<Option<&'a toml::Value>, ConfigError> {
    match value.get(key) {
        None => Ok(None),
        Some(v) => if v.is_table() {
            Ok(Some(v))
        } else {
            Err(ConfigError::Invalid(key, "must be a table".to_string()))
        },
    }
}

fn port_number(key: &'static str, port: i64) -> Result<u16, ConfigError> {
    if port < 1 || port > i64::from(u16::max_value()) {
        return Err(ConfigError::Invalid(
            key,
            format!("{} is not a port number", port),
        ));
    }
    Ok(port as u16)
}

fn millis(key: &'static str, ms: i64, min: i64) -> Result<Duration, ConfigError> {
    if ms < min {
        return Err(ConfigError::Invalid(
            key,
            format!("must be at least {} milliseconds", min),
        ));
    }
    Ok(Duration::from_millis(ms as u64))
}

fn count(key: &'static str, n: i64) -> Result<usize, ConfigError> {
    if n < 1 {
        return Err(ConfigError::Invalid(key, "must be at least 1".to_string()));
    }
    Ok(n as usize)
}
