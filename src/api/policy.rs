//! Access policy evaluation for static rights and capability tokens.
//!
//! Pure functions: no I/O, no clock reads. Deleting expired tokens is left to
//! the caller, which learns about it through [`TokenDenial::expired`].

use super::errors::ProxyError;
use crate::types::{AccessLevel, ArchiveManifest, CapabilityToken, PathScope, Rights};
use axum::http::Method;
use chrono::{DateTime, Utc};

/// Access level a method needs; `None` for methods never allowed.
fn required_level(method: &Method) -> Option<AccessLevel> {
    match *method {
        Method::GET | Method::HEAD | Method::OPTIONS => Some(AccessLevel::Read),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE => {
            Some(AccessLevel::ReadWrite)
        }
        _ => None,
    }
}

/// Check static rights (API keys and anonymous callers).
pub fn check_basic_rights(rights: &Rights, bucket: &str, method: &Method) -> Result<(), ProxyError> {
    if let Rights::GrantAll = rights {
        return Ok(());
    }

    let granted = rights
        .access_level(bucket)
        .ok_or_else(|| ProxyError::Forbidden("Access to this bucket denied".into()))?;

    match (required_level(method), granted) {
        (None, _) => Err(ProxyError::Forbidden("HTTP method denied".into())),
        (Some(AccessLevel::Read), _) | (Some(AccessLevel::ReadWrite), AccessLevel::ReadWrite) => {
            Ok(())
        }
        (Some(AccessLevel::ReadWrite), AccessLevel::Read) => Err(ProxyError::Forbidden(
            "Write access to this bucket denied".into(),
        )),
    }
}

/// Why a token was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDenial {
    pub reason: String,
    /// The token is used up (by time or count) and should be deleted unless
    /// it is marked `preserve`.
    pub expired: bool,
}

impl TokenDenial {
    fn expired(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            expired: true,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            expired: false,
        }
    }
}

impl From<TokenDenial> for ProxyError {
    fn from(denial: TokenDenial) -> Self {
        ProxyError::Forbidden(denial.reason)
    }
}

/// Check a token against a request. Order matters: expiry is decided before
/// any scope check so an exhausted token is always reported (and removed) as
/// such.
///
/// On success returns the archive manifest when the request is an archive
/// download.
pub fn check_token_rights(
    token: &CapabilityToken,
    bucket: &str,
    method: &Method,
    path: &str,
    now: DateTime<Utc>,
) -> Result<Option<ArchiveManifest>, TokenDenial> {
    if token.timeout.is_some_and(|timeout| timeout < now) {
        return Err(TokenDenial::expired("Token expiration (timeout)"));
    }
    if token.count.is_some_and(|count| count <= 0) {
        return Err(TokenDenial::expired("Token expiration (count)"));
    }

    if !token.buckets.iter().any(|b| b == bucket) {
        return Err(TokenDenial::denied("Access to this bucket denied"));
    }

    if let Some(methods) = &token.methods {
        let listed = |m: &str| methods.iter().any(|allowed| allowed == m);
        let allowed = listed(method.as_str())
            || (matches!(*method, Method::HEAD | Method::OPTIONS) && listed("GET"));
        if !allowed {
            return Err(TokenDenial::denied(format!("HTTP method {} denied", method)));
        }
    }

    let path_denied = || TokenDenial::denied(format!("Access to path {} denied", path));
    match &token.scope {
        PathScope::Archive(manifest) if manifest.path == path => {
            // Archives are download-only.
            if !matches!(*method, Method::GET | Method::HEAD) {
                return Err(TokenDenial::denied(format!("HTTP method {} denied", method)));
            }
            Ok(Some(manifest.clone()))
        }
        PathScope::Archive(_) => Err(path_denied()),
        PathScope::Exact(exact) if exact != path => Err(path_denied()),
        PathScope::Prefix(dir) if !path.starts_with(dir.as_str()) => Err(path_denied()),
        PathScope::Exact(_) | PathScope::Prefix(_) | PathScope::Unrestricted => Ok(None),
    }
}
