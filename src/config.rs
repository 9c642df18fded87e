//! Configuration loading and validation.
//!
//! The file is deserialised into a raw form where every key is optional, then
//! validated in a single pass so that every problem is reported at once.

use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Location of the configuration file, relative to the working directory.
pub const CONFIG_PATH: &str = "serve-tunnel.toml";

/// Matches the public hosts ngrok hands out (`*.ngrok-free.app`, `*.ngrok.io`, ...).
pub const DEFAULT_URL_PATTERN: &str =
    r"https://[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.ngrok(?:-free)?\.(?:app|io|dev)";

const DEFAULT_ADMIN_API: &str = "http://127.0.0.1:4040/api/tunnels";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("failed to read configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid configuration ({} problem(s)):\n{}", .0.len(), render_issues(.0))]
    Invalid(Vec<ConfigIssue>),
}

impl ConfigError {
    /// Keys reported by a validation failure, in the order they were checked.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            ConfigError::Invalid(issues) => issues.iter().map(|i| i.key.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn render_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("  - {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub key: String,
    pub kind: IssueKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    Missing,
    Empty,
    Invalid(String),
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            IssueKind::Missing => write!(f, "`{}` is required but missing", self.key),
            IssueKind::Empty => write!(f, "`{}` must not be empty", self.key),
            IssueKind::Invalid(why) => write!(f, "`{}` is invalid: {why}", self.key),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Production,
    Test,
}

/// Which member exits end the `Running` phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Any supervised process exiting triggers shutdown.
    #[default]
    Any,
    /// Only the serving process exiting triggers shutdown; a tunnel exit is logged.
    Serving,
}

/// Credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub mode: Mode,
    pub model: ModelConfig,
    pub server: ServerConfig,
    pub tunnel: TunnelConfig,
    pub paths: PathsConfig,
    pub readiness: ReadinessConfig,
    pub discovery: DiscoveryConfig,
    pub keep_alive: KeepAliveConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub primary: String,
    pub test: String,
    pub primary_args: Vec<String>,
    pub test_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub command: Vec<String>,
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub chat_path: String,
    pub trust_remote_code: bool,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub command: Vec<String>,
    pub authtoken: Secret,
    pub label: String,
    pub domain: Option<String>,
    pub admin_api: String,
    pub url_pattern: Regex,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub initial_delay: Duration,
    pub window: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

impl ReadinessConfig {
    /// Total time the controller may spend waiting for readiness.
    pub fn budget(&self) -> Duration {
        self.initial_delay + self.window
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub settle_delay: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub initial_delay: Duration,
    pub interval: Duration,
    pub prompts: Vec<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub exit_policy: ExitPolicy,
    pub grace_period: Duration,
    pub sweep_port: bool,
    pub sweep_patterns: bool,
}

impl Configuration {
    pub fn active_model(&self) -> &str {
        match self.mode {
            Mode::Production => &self.model.primary,
            Mode::Test => &self.model.test,
        }
    }

    pub fn active_args(&self) -> &[String] {
        match self.mode {
            Mode::Production => &self.model.primary_args,
            Mode::Test => &self.model.test_args,
        }
    }

    /// `host:port` the serving process binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Base URL for reaching the serving process from this host.
    pub fn local_base_url(&self) -> String {
        let host = match self.server.host.as_str() {
            "0.0.0.0" | "::" | "[::]" => "127.0.0.1".to_string(),
            // IPv6 literals need brackets inside a URL authority.
            other if other.contains(':') && !other.starts_with('[') => format!("[{other}]"),
            other => other.to_string(),
        };
        format!("http://{host}:{}", self.server.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.local_base_url(), self.server.health_path)
    }

    pub fn log_path(&self, file_name: &str) -> PathBuf {
        self.paths.log_dir.join(file_name)
    }
}

/// Read, parse and validate the configuration at `path`.
pub fn load(path: &Path) -> Result<Configuration, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text).map_err(|e| match e {
        ConfigError::Parse { message, .. } => ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })
}

/// Parse and validate configuration text.
pub fn parse(text: &str) -> Result<Configuration, ConfigError> {
    let raw: RawConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
        path: PathBuf::from(CONFIG_PATH),
        message: e.to_string(),
    })?;
    raw.validate()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    mode: Mode,
    model: RawModel,
    server: RawServer,
    tunnel: RawTunnel,
    paths: RawPaths,
    readiness: RawReadiness,
    discovery: RawDiscovery,
    keep_alive: RawKeepAlive,
    shutdown: RawShutdown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawModel {
    primary: Option<String>,
    test: Option<String>,
    primary_args: Vec<String>,
    test_args: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawServer {
    command: Option<Vec<String>>,
    host: Option<String>,
    port: Option<u16>,
    health_path: Option<String>,
    chat_path: Option<String>,
    trust_remote_code: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTunnel {
    command: Option<Vec<String>>,
    authtoken: Option<String>,
    label: Option<String>,
    domain: Option<String>,
    admin_api: Option<String>,
    url_pattern: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPaths {
    cache_dir: Option<String>,
    log_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawReadiness {
    #[serde(with = "humantime_serde")]
    initial_delay: Option<Duration>,
    #[serde(with = "humantime_serde")]
    window: Option<Duration>,
    #[serde(with = "humantime_serde")]
    poll_interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    probe_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDiscovery {
    #[serde(with = "humantime_serde")]
    settle_delay: Option<Duration>,
    #[serde(with = "humantime_serde")]
    request_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawKeepAlive {
    enabled: bool,
    endpoint: Option<String>,
    #[serde(with = "humantime_serde")]
    initial_delay: Option<Duration>,
    #[serde(with = "humantime_serde")]
    interval: Option<Duration>,
    prompts: Vec<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    #[serde(with = "humantime_serde")]
    request_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawShutdown {
    exit_policy: ExitPolicy,
    #[serde(with = "humantime_serde")]
    grace_period: Option<Duration>,
    sweep_port: Option<bool>,
    sweep_patterns: Option<bool>,
}

/// Collects every problem found while validating.
#[derive(Default)]
struct Issues(Vec<ConfigIssue>);

impl Issues {
    fn push(&mut self, key: &str, kind: IssueKind) {
        self.0.push(ConfigIssue {
            key: key.to_string(),
            kind,
        });
    }

    fn required(&mut self, key: &str, value: Option<String>) -> String {
        match value {
            None => self.push(key, IssueKind::Missing),
            Some(v) if v.trim().is_empty() => self.push(key, IssueKind::Empty),
            Some(v) => return v.trim().to_string(),
        }
        String::new()
    }

    fn command(&mut self, key: &str, value: Option<Vec<String>>, default: &[&str]) -> Vec<String> {
        let cmd = value.unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect());
        if cmd.first().map_or(true, |p| p.trim().is_empty()) {
            self.push(key, IssueKind::Empty);
        }
        cmd
    }

    fn positive(&mut self, key: &str, value: Option<Duration>, default: Duration) -> Duration {
        let d = value.unwrap_or(default);
        if d.is_zero() {
            self.push(key, IssueKind::Invalid("must be greater than zero".into()));
        }
        d
    }
}

fn path_with_leading_slash(value: Option<String>, default: &str) -> String {
    let p = value.unwrap_or_else(|| default.to_string());
    if p.starts_with('/') {
        p
    } else {
        format!("/{p}")
    }
}

impl RawConfig {
    fn validate(self) -> Result<Configuration, ConfigError> {
        let mut issues = Issues::default();

        let model = ModelConfig {
            primary: issues.required("model.primary", self.model.primary),
            test: issues.required("model.test", self.model.test),
            primary_args: self.model.primary_args,
            test_args: self.model.test_args,
        };

        let server_command = issues.command("server.command", self.server.command, &["vllm", "serve"]);
        let host = issues.required("server.host", self.server.host);
        let port = match self.server.port {
            None => {
                issues.push("server.port", IssueKind::Missing);
                0
            }
            Some(0) => {
                issues.push("server.port", IssueKind::Invalid("port 0 is not bindable".into()));
                0
            }
            Some(p) => p,
        };
        let server = ServerConfig {
            command: server_command,
            host,
            port,
            health_path: path_with_leading_slash(self.server.health_path, "/health"),
            chat_path: path_with_leading_slash(self.server.chat_path, "/v1/chat/completions"),
            trust_remote_code: self.server.trust_remote_code.unwrap_or(true),
        };

        let tunnel_command = issues.command("tunnel.command", self.tunnel.command, &["ngrok", "http"]);
        let authtoken = Secret(issues.required("tunnel.authtoken", self.tunnel.authtoken));
        let label = issues.required("tunnel.label", self.tunnel.label);
        let admin_api = self
            .tunnel
            .admin_api
            .unwrap_or_else(|| DEFAULT_ADMIN_API.to_string());
        if let Err(e) = Url::parse(&admin_api) {
            issues.push("tunnel.admin_api", IssueKind::Invalid(e.to_string()));
        }
        let pattern_src = self
            .tunnel
            .url_pattern
            .unwrap_or_else(|| DEFAULT_URL_PATTERN.to_string());
        let url_pattern = match Regex::new(&pattern_src) {
            Ok(re) => Some(re),
            Err(e) => {
                issues.push("tunnel.url_pattern", IssueKind::Invalid(e.to_string()));
                None
            }
        };
        let domain = self.tunnel.domain.filter(|d| !d.trim().is_empty());

        let paths = PathsConfig {
            cache_dir: PathBuf::from(issues.required("paths.cache_dir", self.paths.cache_dir)),
            log_dir: PathBuf::from(issues.required("paths.log_dir", self.paths.log_dir)),
        };

        let readiness = ReadinessConfig {
            initial_delay: self.readiness.initial_delay.unwrap_or(Duration::from_secs(60)),
            window: issues.positive("readiness.window", self.readiness.window, Duration::from_secs(120)),
            poll_interval: issues.positive(
                "readiness.poll_interval",
                self.readiness.poll_interval,
                Duration::from_secs(5),
            ),
            probe_timeout: issues.positive(
                "readiness.probe_timeout",
                self.readiness.probe_timeout,
                Duration::from_secs(5),
            ),
        };

        let discovery = DiscoveryConfig {
            settle_delay: self.discovery.settle_delay.unwrap_or(Duration::from_secs(5)),
            request_timeout: issues.positive(
                "discovery.request_timeout",
                self.discovery.request_timeout,
                Duration::from_secs(5),
            ),
        };

        let ka = self.keep_alive;
        let endpoint = ka.endpoint.filter(|e| !e.trim().is_empty());
        if let Some(e) = endpoint.as_deref() {
            if let Err(err) = Url::parse(e) {
                issues.push("keep_alive.endpoint", IssueKind::Invalid(err.to_string()));
            }
        }
        if ka.enabled && ka.prompts.iter().all(|p| p.trim().is_empty()) {
            issues.push("keep_alive.prompts", IssueKind::Empty);
        }
        let keep_alive = KeepAliveConfig {
            enabled: ka.enabled,
            endpoint,
            initial_delay: ka.initial_delay.unwrap_or(Duration::from_secs(600)),
            interval: issues.positive("keep_alive.interval", ka.interval, Duration::from_secs(300)),
            prompts: ka
                .prompts
                .into_iter()
                .filter(|p| !p.trim().is_empty())
                .collect(),
            temperature: ka.temperature.unwrap_or(0.7),
            max_tokens: ka.max_tokens.unwrap_or(64),
            request_timeout: issues.positive(
                "keep_alive.request_timeout",
                ka.request_timeout,
                Duration::from_secs(60),
            ),
        };

        let shutdown = ShutdownConfig {
            exit_policy: self.shutdown.exit_policy,
            grace_period: self.shutdown.grace_period.unwrap_or(Duration::from_secs(5)),
            sweep_port: self.shutdown.sweep_port.unwrap_or(true),
            sweep_patterns: self.shutdown.sweep_patterns.unwrap_or(true),
        };

        let url_pattern = match url_pattern {
            Some(re) if issues.0.is_empty() => re,
            _ => return Err(ConfigError::Invalid(issues.0)),
        };
        let tunnel = TunnelConfig {
            command: tunnel_command,
            authtoken,
            label,
            domain,
            admin_api,
            url_pattern,
        };

        Ok(Configuration {
            mode: self.mode,
            model,
            server,
            tunnel,
            paths,
            readiness,
            discovery,
            keep_alive,
            shutdown,
        })
    }
}
