//! Configuration for the s3gate proxy

use crate::types::Rights;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Public hostname; buckets are addressed as `<bucket>.<hostname>` or `<hostname>/<bucket>`
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Port clients put in the `Host` header. Defaults to the listen port.
    #[serde(default)]
    pub public_port: Option<u16>,

    /// Authentication family: S3 signatures or web tokens
    #[serde(default)]
    pub mode: ProxyMode,

    /// HostId reported in error bodies. Random when unset.
    #[serde(default)]
    pub host_id: Option<String>,

    /// Log level filter string. Overridden by RUST_LOG.
    /// Default: "s3gate=debug,tower_http=info"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Separate listener for `/metrics` and `/health`
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,

    /// Default backend target
    #[serde(default)]
    pub backend: Option<TargetConfig>,

    /// Per-bucket overrides, merged field by field over `backend`
    #[serde(default)]
    pub buckets: BTreeMap<String, TargetConfig>,

    /// Static API keys, by access key id
    #[serde(default)]
    pub clients: BTreeMap<String, ClientConfig>,

    /// Rights for callers presenting no credentials
    #[serde(default)]
    pub anonymous: Option<Rights>,

    /// Capability token store (web mode)
    #[serde(default)]
    pub tokens: Option<TokenStoreConfig>,

    /// Access log for token uses (web mode)
    #[serde(default)]
    pub access_log: Option<AccessLogConfig>,
}

/// Which authentication family the proxy speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Clients sign requests like they would for S3
    #[default]
    S3,
    /// Clients present a `token` query parameter
    Web,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProxyMode::S3 => "s3",
            ProxyMode::Web => "web",
        })
    }
}

impl FromStr for ProxyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(ProxyMode::S3),
            "web" => Ok(ProxyMode::Web),
            other => Err(ConfigError::Invalid(format!(
                "unknown mode '{}', expected 's3' or 'web'",
                other
            ))),
        }
    }
}

/// Backend endpoint and credentials. Every field is optional so per-bucket
/// tables can override just what differs from the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Endpoint URL, e.g. `https://s3.eu-west-1.amazonaws.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,

    /// Signing region (default: us-east-1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Address buckets as `<target>/<bucket>` instead of `<bucket>.<host>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_style: Option<bool>,
}

impl TargetConfig {
    /// Fields of `self` win; missing ones come from `fallback`.
    fn merged_over(&self, fallback: Option<&TargetConfig>) -> TargetConfig {
        let fallback = fallback.cloned().unwrap_or_default();
        TargetConfig {
            target: self.target.clone().or(fallback.target),
            access_key_id: self.access_key_id.clone().or(fallback.access_key_id),
            secret_access_key: self.secret_access_key.clone().or(fallback.secret_access_key),
            region: self.region.clone().or(fallback.region),
            path_style: self.path_style.or(fallback.path_style),
        }
    }
}

/// A static API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub secret_access_key: String,
    #[serde(flatten)]
    pub rights: Rights,
}

/// Token store backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TokenStoreConfig {
    /// One JSON document per token in a directory
    Dir { path: PathBuf },
}

/// Access log backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AccessLogConfig {
    /// Append one JSON object per line to a file
    Jsonl { path: PathBuf },
}

/// A fully resolved backend for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTarget {
    pub scheme: String,
    /// `host[:port]` of the endpoint (default ports omitted)
    pub authority: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub path_style: bool,
}

impl BucketTarget {
    fn resolve(name: &str, config: &TargetConfig) -> Result<Self, ConfigError> {
        let target = config
            .target
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid(format!("{}: no target URL", name)))?;
        let url = reqwest::Url::parse(target)
            .map_err(|e| ConfigError::Invalid(format!("{}: bad target '{}': {}", name, target, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::Invalid(format!("{}: target '{}' has no host", name, target)))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let access_key_id = config
            .access_key_id
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Invalid(format!("{}: no access_key_id", name)))?;
        let secret_access_key = config
            .secret_access_key
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Invalid(format!("{}: no secret_access_key", name)))?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            authority,
            access_key_id,
            secret_access_key,
            region: config.region.clone().unwrap_or_else(default_region),
            path_style: config.path_style.unwrap_or(false),
        })
    }

    /// `Host` the backend request is sent with.
    pub fn host_for(&self, bucket: &str) -> String {
        if self.path_style {
            self.authority.clone()
        } else {
            format!("{}.{}", bucket, self.authority)
        }
    }

    /// Decoded backend path for an object path inside `bucket`.
    pub fn path_for(&self, bucket: &str, path: &str) -> String {
        if self.path_style {
            format!("/{}{}", bucket, path)
        } else {
            path.to_string()
        }
    }

    /// Full URL from an already encoded path and query string.
    pub fn url_for(&self, bucket: &str, encoded_path: &str, query: &str) -> String {
        let mut url = format!("{}://{}{}", self.scheme, self.host_for(bucket), encoded_path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Default target plus per-bucket targets, resolved once at startup.
#[derive(Debug, Clone, Default)]
pub struct ResolvedTargets {
    pub default: Option<Arc<BucketTarget>>,
    pub buckets: HashMap<String, Arc<BucketTarget>>,
}

impl ResolvedTargets {
    /// Per-bucket target, else the default.
    pub fn get(&self, bucket: &str) -> Option<Arc<BucketTarget>> {
        self.buckets
            .get(bucket)
            .or(self.default.as_ref())
            .cloned()
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_log_level() -> String {
    "s3gate=debug,tower_http=info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            hostname: default_hostname(),
            public_port: None,
            mode: ProxyMode::default(),
            host_id: None,
            log_level: default_log_level(),
            metrics_addr: None,
            backend: None,
            buckets: BTreeMap::new(),
            clients: BTreeMap::new(),
            anonymous: None,
            tokens: None,
            access_log: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("S3GATE_LISTEN_ADDR").and_then(|a| a.parse().ok()) {
            config.listen_addr = addr;
        }
        if let Some(hostname) = var("S3GATE_HOSTNAME") {
            config.hostname = hostname;
        }
        config.public_port = var("S3GATE_PUBLIC_PORT").and_then(|p| p.parse().ok());
        if let Some(mode) = var("S3GATE_MODE").and_then(|m| m.parse().ok()) {
            config.mode = mode;
        }
        config.host_id = var("S3GATE_HOST_ID");
        if let Some(level) = var("S3GATE_LOG_LEVEL") {
            config.log_level = level;
        }
        config.metrics_addr = var("S3GATE_METRICS_ADDR").and_then(|a| a.parse().ok());

        if let Some(target) = var("S3GATE_TARGET") {
            config.backend = Some(TargetConfig {
                target: Some(target),
                access_key_id: var("S3GATE_ACCESS_KEY_ID"),
                secret_access_key: var("S3GATE_SECRET_ACCESS_KEY"),
                region: var("S3GATE_REGION"),
                path_style: var("S3GATE_PATH_STYLE").map(|v| v == "true" || v == "1"),
            });
        }

        if let Some(dir) = var("S3GATE_TOKEN_DIR") {
            config.tokens = Some(TokenStoreConfig::Dir {
                path: PathBuf::from(dir),
            });
        }
        if let Some(path) = var("S3GATE_ACCESS_LOG") {
            config.access_log = Some(AccessLogConfig::Jsonl {
                path: PathBuf::from(path),
            });
        }

        config
    }

    /// Load configuration from `explicit`, `S3GATE_CONFIG` or a default file
    /// location, falling back to environment variables.
    ///
    /// Returns the config together with the file it came from, if any.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        if let Ok(path) = std::env::var("S3GATE_CONFIG") {
            let path = PathBuf::from(path);
            return Ok((Self::from_file(&path)?, Some(path)));
        }

        for path in ["s3gate.toml", "/etc/s3gate/config.toml"] {
            let path = Path::new(path);
            if path.exists() {
                return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
            }
        }

        Ok((Self::from_env(), None))
    }

    /// Port expected in the `Host` header.
    pub fn public_port(&self) -> u16 {
        self.public_port.unwrap_or_else(|| self.listen_addr.port())
    }

    /// Resolve the default target and every per-bucket target.
    pub fn resolve_targets(&self) -> Result<ResolvedTargets, ConfigError> {
        if self.backend.is_none() && self.buckets.is_empty() {
            return Err(ConfigError::Invalid(
                "no backend: configure [backend] or at least one [buckets.<name>]".into(),
            ));
        }

        let default = self
            .backend
            .as_ref()
            .map(|backend| BucketTarget::resolve("backend", backend).map(Arc::new))
            .transpose()?;

        let buckets = self
            .buckets
            .iter()
            .map(|(name, overrides)| {
                let merged = overrides.merged_over(self.backend.as_ref());
                BucketTarget::resolve(&format!("buckets.{}", name), &merged)
                    .map(|target| (name.clone(), Arc::new(target)))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;

        Ok(ResolvedTargets { default, buckets })
    }

    /// Check everything that can be checked before serving.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.is_empty() {
            return Err(ConfigError::Invalid("hostname must not be empty".into()));
        }
        self.resolve_targets()?;

        if let Some((id, _)) = self
            .clients
            .iter()
            .find(|(_, client)| client.secret_access_key.is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "clients.{}: empty secret_access_key",
                id
            )));
        }
        if self.mode == ProxyMode::Web && self.tokens.is_none() && self.anonymous.is_none() {
            return Err(ConfigError::Invalid(
                "web mode needs [tokens] or [anonymous]".into(),
            ));
        }
        if self.access_log.is_some() && self.tokens.is_none() {
            return Err(ConfigError::Invalid("[access_log] requires [tokens]".into()));
        }
        Ok(())
    }
}

/// Random 20-character upper-case access key id.
pub fn generate_access_key_id() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Random 40-character secret access key.
pub fn generate_secret_access_key() -> String {
    let mut bytes = [0u8; 30];
    rand::thread_rng().fill(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Add (or replace) a `[clients.<id>]` table in the config file at `path`,
/// leaving the rest of the file's keys untouched. Creates the file if needed.
pub fn add_client_to_file(
    path: &Path,
    access_key_id: &str,
    client: &ClientConfig,
) -> Result<(), ConfigError> {
    let mut document = if path.exists() {
        std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?
            .parse::<toml::Table>()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
    } else {
        toml::Table::new()
    };

    let entry = toml::Value::try_from(client).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let clients = document
        .entry("clients")
        .or_insert(toml::Value::Table(toml::Table::new()));
    let toml::Value::Table(clients) = clients else {
        return Err(ConfigError::Parse("'clients' is not a table".into()));
    };
    clients.insert(access_key_id.to_string(), entry);

    let content =
        toml::to_string_pretty(&document).map_err(|e| ConfigError::Parse(e.to_string()))?;
    std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
