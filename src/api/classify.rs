//! Request classification: which bucket, which backend, which path.

use super::errors::ProxyError;
use crate::config::{BucketTarget, ResolvedTargets};
use crate::sigv4::{decode_query, percent_decode};
use crate::types::ArchiveManifest;
use axum::http::{header, HeaderMap, Method, Uri};
use regex::Regex;
use std::sync::Arc;

/// How the caller was authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Signed `Authorization` header
    HeaderSigned,
    /// Presigned query string, with the validity the caller asked for
    QuerySigned { expires: u64 },
    /// Web capability token
    Token { token: String },
    Anonymous,
}

/// Everything known about one request once it has been classified.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub bucket: String,
    /// The bucket was the first path segment rather than a host label.
    pub bucket_in_path: bool,
    pub target: Arc<BucketTarget>,
    /// Decoded object path, bucket segment removed. Never empty.
    pub path: String,
    /// Decoded query pairs in request order.
    pub query: Vec<(String, String)>,
    pub auth: AuthMode,
    /// Set when a token resolved the request to an archive download.
    pub archive: Option<ArchiveManifest>,
}

impl RequestContext {
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Maps `Host` and path to a bucket and its backend target.
pub struct Classifier {
    host_pattern: Regex,
    path_bucket: Regex,
    targets: ResolvedTargets,
}

impl Classifier {
    pub fn new(hostname: &str, port: u16, targets: ResolvedTargets) -> Result<Self, regex::Error> {
        let host_pattern = Regex::new(&format!(
            r"^(?:([a-z0-9_-]+)\.)?{}(?::{})?$",
            regex::escape(&hostname.to_ascii_lowercase()),
            port
        ))?;
        let path_bucket = Regex::new(r"(?s)^/([a-z0-9_-]+)(/.*)?$")?;
        Ok(Self {
            host_pattern,
            path_bucket,
            targets,
        })
    }

    pub fn targets(&self) -> &ResolvedTargets {
        &self.targets
    }

    pub fn classify(
        &self,
        request_id: String,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> Result<RequestContext, ProxyError> {
        let host = match headers.get(header::HOST) {
            Some(value) => value
                .to_str()
                .map_err(|_| ProxyError::BadRequest("Bad host".into()))?
                .to_ascii_lowercase(),
            None => uri
                .authority()
                .map(|a| a.as_str().to_ascii_lowercase())
                .ok_or_else(|| ProxyError::BadRequest("No host".into()))?,
        };

        let host_match = self
            .host_pattern
            .captures(&host)
            .ok_or_else(|| ProxyError::BadRequest("Bad host".into()))?;

        let decoded_path = percent_decode(uri.path());
        let (bucket, path, bucket_in_path) = match host_match.get(1) {
            Some(label) => (label.as_str().to_string(), decoded_path, false),
            None => {
                let path_match = self
                    .path_bucket
                    .captures(&decoded_path)
                    .ok_or_else(|| ProxyError::NotFound("Bucket not found".into()))?;
                let rest = path_match.get(2).map(|m| m.as_str()).unwrap_or("/");
                (path_match[1].to_string(), rest.to_string(), true)
            }
        };
        let path = if path.is_empty() { "/".to_string() } else { path };

        let target = self
            .targets
            .get(&bucket)
            .ok_or_else(|| ProxyError::NotFound("Bucket not found".into()))?;

        Ok(RequestContext {
            request_id,
            method: method.clone(),
            bucket,
            bucket_in_path,
            target,
            path,
            query: uri.query().map(decode_query).unwrap_or_default(),
            auth: AuthMode::Anonymous,
            archive: None,
        })
    }
}

/// Fresh id used to correlate logs and error bodies.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
