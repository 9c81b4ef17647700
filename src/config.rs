use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer};

use crate::view::{DefaultRule, View, ViewBuildError, ViewSet};

/// 未显式指定配置文件时依次尝试的位置 / Locations tried after the explicit override.
pub const CONFIG_SEARCH_PATHS: &[&str] = &[
    "/etc/dnsviews/dnsviews.yaml",
    "/etc/dnsviews/dnsviews.yml",
    "/etc/dnsviews/dnsviews.json",
    "dnsviews.yaml",
    "dnsviews.yml",
    "dnsviews.json",
];

/// 配置文件格式，按扩展名判断 / File format, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// `.yaml` / `.yml` (any case) is YAML; everything else is read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// 调试日志开关。
    #[serde(default)]
    pub debug: bool,
    /// 全局默认规则：allow，其余一律视为 deny。
    #[serde(default)]
    pub default_rule: Option<String>,
    /// 上游 DNS，host:port。
    pub upstream: String,
    /// 监听地址（UDP 与 TCP 共用），缺省 0.0.0.0:53。
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 单次上游交换超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Missing and empty are both rejected by [`RuntimeConfig::from_config`].
    #[serde(default)]
    pub views: Option<Vec<ViewConfig>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// 日志是否带时间戳。
    #[serde(default)]
    pub include_date: bool,
    /// 输出 JSON 格式日志。
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub sources: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub include: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub exclude: Vec<String>,
    /// allow / deny / default
    #[serde(default)]
    pub rule: Option<String>,
}

// `include:` with no items is null in YAML
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_listen() -> String {
    "0.0.0.0:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot load config file (tried: {})", describe_attempts(.0))]
    NotFound(Vec<SkippedSource>),

    #[error("missing 'views' list")]
    MissingViews,

    #[error(transparent)]
    InvalidView(#[from] ViewBuildError),
}

/// A candidate config path that was not used, with the reason.
#[derive(Debug, Clone)]
pub struct SkippedSource {
    pub path: PathBuf,
    pub reason: String,
}

fn describe_attempts(attempts: &[SkippedSource]) -> String {
    if attempts.is_empty() {
        return "no candidate paths".to_string();
    }
    attempts
        .iter()
        .map(|s| format!("{}: {}", s.path.display(), s.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: PathBuf,
    pub config: Config,
    /// Earlier candidates that were passed over; logged once tracing is up.
    pub skipped: Vec<SkippedSource>,
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    parse_config(&raw, ConfigFormat::from_path(path))
        .with_context(|| format!("parse config file: {}", path.display()))
}

pub fn parse_config(raw: &str, format: ConfigFormat) -> anyhow::Result<Config> {
    let cfg: Config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(raw)?,
        ConfigFormat::Json => serde_json::from_str(raw)?,
    };
    Ok(cfg)
}

/// 按顺序查找第一个可读且可解析的配置 / First existing and parseable candidate wins.
pub fn find_config(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let candidates = explicit
        .map(Path::to_path_buf)
        .into_iter()
        .chain(CONFIG_SEARCH_PATHS.iter().map(PathBuf::from));
    find_config_in(candidates)
}

pub fn find_config_in(
    candidates: impl IntoIterator<Item = PathBuf>,
) -> Result<LoadedConfig, ConfigError> {
    let mut skipped = Vec::new();
    for path in candidates {
        if path.as_os_str().is_empty() {
            continue;
        }
        if !path.exists() {
            skipped.push(SkippedSource {
                path,
                reason: "not found".to_string(),
            });
            continue;
        }
        match load_config(&path) {
            Ok(config) => {
                return Ok(LoadedConfig {
                    path,
                    config,
                    skipped,
                });
            }
            Err(err) => skipped.push(SkippedSource {
                path,
                reason: format!("{err:#}"),
            }),
        }
    }
    Err(ConfigError::NotFound(skipped))
}

/// 编译后的运行时配置 / Validated configuration, built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub debug: bool,
    pub upstream: String,
    pub listen: String,
    pub upstream_timeout: Duration,
    pub logging: LoggingConfig,
    pub views: ViewSet,
}

impl RuntimeConfig {
    /// `fallback_rule` applies when the file has no `default_rule` (CLI / environment value).
    pub fn from_config(cfg: Config, fallback_rule: Option<&str>) -> Result<Self, ConfigError> {
        let view_cfgs = match cfg.views {
            Some(v) if !v.is_empty() => v,
            _ => return Err(ConfigError::MissingViews),
        };
        let mut views = Vec::with_capacity(view_cfgs.len());
        for vc in view_cfgs {
            views.push(View::from_config(vc)?);
        }
        let default_rule = cfg
            .default_rule
            .as_deref()
            .or(fallback_rule)
            .map(DefaultRule::parse)
            .unwrap_or_default();

        Ok(Self {
            debug: cfg.debug,
            upstream: cfg.upstream,
            listen: cfg.listen,
            upstream_timeout: Duration::from_millis(cfg.upstream_timeout_ms),
            logging: cfg.logging,
            views: ViewSet::new(views, default_rule),
        })
    }
}

/// Resolve a `host:port` string once. A bare `:port` binds every IPv4 interface.
pub async fn resolve_addr(value: &str) -> anyhow::Result<SocketAddr> {
    let value = value.trim();
    let target = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    };
    tokio::net::lookup_host(target.as_str())
        .await
        .with_context(|| format!("resolve '{}'", value))?
        .next()
        .with_context(|| format!("'{}' resolved to no address", value))
}
