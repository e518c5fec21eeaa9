//! Access-control model shared by the authenticator and the policy evaluator.
//!
//! Static rights come from configuration and never change; capability tokens
//! are persisted documents that the proxy reads on every web request and
//! writes back after each successful use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Manifest path used when an archive restriction does not name one.
pub const DEFAULT_ARCHIVE_PATH: &str = "/archive.zip";

/// Access level granted on a single bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessLevel {
    #[serde(rename = "r", alias = "read")]
    Read,
    #[serde(rename = "rw", alias = "readWrite", alias = "read-write")]
    ReadWrite,
}

/// Rights attached to a static API key or to anonymous callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RightsConfig", into = "RightsConfig")]
pub enum Rights {
    /// Full access to every bucket.
    GrantAll,
    /// Per-bucket access levels; buckets not listed are denied.
    Buckets(BTreeMap<String, AccessLevel>),
}

impl Rights {
    pub fn access_level(&self, bucket: &str) -> Option<AccessLevel> {
        match self {
            Rights::GrantAll => Some(AccessLevel::ReadWrite),
            Rights::Buckets(map) => map.get(bucket).copied(),
        }
    }
}

/// On-disk shape of [`Rights`]: `grant_all = true` or a `buckets` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RightsConfig {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    grant_all: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    buckets: BTreeMap<String, AccessLevel>,
}

impl From<RightsConfig> for Rights {
    fn from(config: RightsConfig) -> Self {
        if config.grant_all {
            Rights::GrantAll
        } else {
            Rights::Buckets(config.buckets)
        }
    }
}

impl From<Rights> for RightsConfig {
    fn from(rights: Rights) -> Self {
        match rights {
            Rights::GrantAll => RightsConfig {
                grant_all: true,
                buckets: BTreeMap::new(),
            },
            Rights::Buckets(buckets) => RightsConfig {
                grant_all: false,
                buckets,
            },
        }
    }
}

/// One file to fetch into an archive download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EntryRecord")]
pub struct ArchiveEntry {
    /// Source bucket; the request's bucket when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    pub path: String,
    /// Name inside the ZIP; the basename of `path` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Manifest entries are either bare paths or full objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum EntryRecord {
    Path(String),
    Full {
        #[serde(default)]
        bucket: Option<String>,
        path: String,
        #[serde(default)]
        filename: Option<String>,
    },
}

impl From<EntryRecord> for ArchiveEntry {
    fn from(record: EntryRecord) -> Self {
        match record {
            EntryRecord::Path(path) => ArchiveEntry {
                bucket: None,
                path,
                filename: None,
            },
            EntryRecord::Full {
                bucket,
                path,
                filename,
            } => ArchiveEntry {
                bucket,
                path,
                filename,
            },
        }
    }
}

/// An ordered list of files streamed as a single ZIP download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// Request path the token is bound to.
    #[serde(default = "default_archive_path")]
    pub path: String,
    /// Download name sent in `Content-Disposition`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub list: Vec<ArchiveEntry>,
}

fn default_archive_path() -> String {
    DEFAULT_ARCHIVE_PATH.to_string()
}

/// A manifest entry with every default filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveItem {
    pub bucket: String,
    pub path: String,
    pub name: String,
}

impl ArchiveManifest {
    pub fn download_name(&self) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| basename(&self.path).to_string())
    }

    /// Resolve entries against the bucket the request was made on.
    pub fn resolve(&self, request_bucket: &str) -> Vec<ArchiveItem> {
        self.list
            .iter()
            .map(|entry| ArchiveItem {
                bucket: entry
                    .bucket
                    .clone()
                    .unwrap_or_else(|| request_bucket.to_string()),
                path: entry.path.clone(),
                name: entry
                    .filename
                    .clone()
                    .unwrap_or_else(|| basename(&entry.path).to_string()),
            })
            .collect()
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("archive.zip")
}

/// Path restriction carried by a capability token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathScope {
    Unrestricted,
    Exact(String),
    /// Directory prefix, always ending with `/`.
    Prefix(String),
    Archive(ArchiveManifest),
}

impl PathScope {
    pub fn prefix(dir: impl Into<String>) -> Self {
        let mut dir = dir.into();
        if !dir.ends_with('/') {
            dir.push('/');
        }
        PathScope::Prefix(dir)
    }
}

#[derive(Debug, Error)]
#[error("invalid token record: {0}")]
pub struct InvalidToken(String);

/// A time and use limited grant, created out-of-band and stored in the token store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TokenRecord", into = "TokenRecord")]
pub struct CapabilityToken {
    pub token: String,
    pub user: Option<String>,
    /// Buckets the token may touch. Never empty.
    pub buckets: Vec<String>,
    /// Remaining uses. Documents without `count` get one use; an explicit
    /// `"count": null` means unlimited.
    pub count: Option<i64>,
    pub timeout: Option<DateTime<Utc>>,
    /// Keep the document after it expires instead of deleting it.
    pub preserve: bool,
    pub used: u64,
    /// Allowed methods (upper case); `None` allows any method.
    pub methods: Option<Vec<String>>,
    pub scope: PathScope,
}

impl CapabilityToken {
    /// Token for a set of buckets with no other restriction.
    pub fn new(token: impl Into<String>, buckets: Vec<String>) -> Self {
        Self {
            token: token.into(),
            user: None,
            buckets,
            count: default_count(),
            timeout: None,
            preserve: false,
            used: 0,
            methods: None,
            scope: PathScope::Unrestricted,
        }
    }
}

fn default_count() -> Option<i64> {
    Some(1)
}

/// Persisted document shape. Accepts a single `bucket` or a `buckets` array
/// and at most one of `path`, `dir_path` and `archive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    buckets: Vec<String>,
    #[serde(default = "default_count")]
    count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<DateTime<Utc>>,
    #[serde(default)]
    preserve: bool,
    #[serde(default)]
    used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, alias = "dirPath", skip_serializing_if = "Option::is_none")]
    dir_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    archive: Option<ArchiveManifest>,
}

impl TryFrom<TokenRecord> for CapabilityToken {
    type Error = InvalidToken;

    fn try_from(record: TokenRecord) -> Result<Self, Self::Error> {
        if record.token.is_empty() {
            return Err(InvalidToken("empty token string".into()));
        }

        let mut buckets = record.buckets;
        if let Some(bucket) = record.bucket {
            if !buckets.contains(&bucket) {
                buckets.insert(0, bucket);
            }
        }
        if buckets.is_empty() {
            return Err(InvalidToken(format!(
                "token {} names no bucket",
                record.token
            )));
        }

        let scope = match (record.path, record.dir_path, record.archive) {
            (None, None, None) => PathScope::Unrestricted,
            (Some(path), None, None) => PathScope::Exact(path),
            (None, Some(dir), None) => PathScope::prefix(dir),
            (None, None, Some(manifest)) => PathScope::Archive(manifest),
            _ => {
                return Err(InvalidToken(format!(
                    "token {} sets more than one of path, dir_path and archive",
                    record.token
                )))
            }
        };

        Ok(CapabilityToken {
            token: record.token,
            user: record.user,
            buckets,
            count: record.count,
            timeout: record.timeout,
            preserve: record.preserve,
            used: record.used,
            methods: record
                .methods
                .map(|methods| methods.iter().map(|m| m.to_ascii_uppercase()).collect()),
            scope,
        })
    }
}

impl From<CapabilityToken> for TokenRecord {
    fn from(token: CapabilityToken) -> Self {
        let (path, dir_path, archive) = match token.scope {
            PathScope::Unrestricted => (None, None, None),
            PathScope::Exact(path) => (Some(path), None, None),
            PathScope::Prefix(dir) => (None, Some(dir), None),
            PathScope::Archive(manifest) => (None, None, Some(manifest)),
        };
        TokenRecord {
            token: token.token,
            user: token.user,
            bucket: None,
            buckets: token.buckets,
            count: token.count,
            timeout: token.timeout,
            preserve: token.preserve,
            used: token.used,
            methods: token.methods,
            path,
            dir_path,
            archive,
        }
    }
}
