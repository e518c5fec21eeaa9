//! Caller authentication
//!
//! S3 mode recomputes the caller's SigV4 signature with the secret of the
//! client it claims to be, then applies that client's static rights. Web mode
//! looks up the `token` query parameter in the token store and applies the
//! token's scope; a successful use updates the token's counters and is
//! written to the access log.
//!
//! Both modes fall back to the `[anonymous]` rights when the request carries
//! no credentials at all.

use super::classify::{AuthMode, RequestContext};
use super::errors::ProxyError;
use super::handlers::AppState;
use super::policy::{check_basic_rights, check_token_rights};
use crate::config::ProxyMode;
use crate::sigv4::{self, AuthCarrier, InboundRequest};
use crate::tokens::{AccessLogEntry, TokenStore};
use crate::types::{CapabilityToken, Rights};
use axum::http::request::Parts;
use chrono::Utc;
use tracing::{debug, warn};

/// Authenticate and authorize the request, recording the outcome in `ctx`.
pub async fn authenticate(
    state: &AppState,
    ctx: &mut RequestContext,
    parts: &Parts,
) -> Result<(), ProxyError> {
    match state.mode {
        ProxyMode::S3 => check_s3_auth(state, ctx, parts),
        ProxyMode::Web => check_web_auth(state, ctx).await,
    }
}

fn anonymous_rights<'a>(state: &'a AppState, reason: &str) -> Result<&'a Rights, ProxyError> {
    state
        .anonymous
        .as_ref()
        .ok_or_else(|| ProxyError::Unauthorized(reason.to_string()))
}

fn check_s3_auth(
    state: &AppState,
    ctx: &mut RequestContext,
    parts: &Parts,
) -> Result<(), ProxyError> {
    let carrier = AuthCarrier::from_request(&parts.headers, &ctx.query)
        .map_err(|e| ProxyError::Unauthorized(e.to_string()))?;

    let Some(carrier) = carrier else {
        let rights = anonymous_rights(state, "No authorization header")?;
        debug!("Anonymous access to bucket {}", ctx.bucket);
        ctx.auth = AuthMode::Anonymous;
        return check_basic_rights(rights, &ctx.bucket, &ctx.method);
    };

    let parsed = carrier.parsed();
    let client = state
        .clients
        .get(&parsed.access_key_id)
        .ok_or_else(|| ProxyError::Unauthorized("Unknown access key ID".into()))?;

    if let AuthCarrier::QueryString(presigned) = &carrier {
        let expired = presigned
            .is_expired(Utc::now())
            .map_err(|e| ProxyError::Unauthorized(e.to_string()))?;
        if expired {
            return Err(ProxyError::Unauthorized("Request has expired".into()));
        }
    }

    let inbound = InboundRequest {
        method: parts.method.as_str(),
        raw_path: parts.uri.path(),
        raw_query: parts.uri.query(),
        headers: &parts.headers,
    };
    let expected = sigv4::expected_signature(&carrier, &inbound, &client.secret_access_key)
        .map_err(|e| ProxyError::Internal(format!("Can't sign request: {}", e)))?;

    if !sigv4::signatures_match(&expected, &parsed.signature) {
        debug!(
            "Signatures mismatch for {}: expected {}, provided {}",
            parsed.access_key_id, expected, parsed.signature
        );
        return Err(ProxyError::Unauthorized("Signatures mismatch".into()));
    }

    debug!("Authenticated access key {}", parsed.access_key_id);
    ctx.auth = match &carrier {
        AuthCarrier::Header(_) => AuthMode::HeaderSigned,
        AuthCarrier::QueryString(presigned) => AuthMode::QuerySigned {
            expires: presigned.expires,
        },
    };
    check_basic_rights(&client.rights, &ctx.bucket, &ctx.method)
}

async fn check_web_auth(state: &AppState, ctx: &mut RequestContext) -> Result<(), ProxyError> {
    let Some(token_value) = ctx.query_param("token").map(str::to_string) else {
        let rights = anonymous_rights(state, "No token provided")?;
        debug!("Anonymous access to bucket {}", ctx.bucket);
        ctx.auth = AuthMode::Anonymous;
        return check_basic_rights(rights, &ctx.bucket, &ctx.method);
    };

    let store = state
        .tokens
        .as_ref()
        .ok_or_else(|| ProxyError::Unauthorized("Tokens are not supported here".into()))?;

    let token = match store.get_by_token(&token_value).await {
        Ok(Some(token)) => token,
        Ok(None) => return Err(ProxyError::Unauthorized("Bad or unknown token".into())),
        Err(e) => {
            warn!("Can't read token: {}", e);
            return Err(ProxyError::Unauthorized("Bad or unknown token".into()));
        }
    };

    let archive = match check_token_rights(&token, &ctx.bucket, &ctx.method, &ctx.path, Utc::now())
    {
        Ok(archive) => archive,
        Err(denial) => {
            if denial.expired && !token.preserve {
                remove_token(store.as_ref(), &token.token).await;
            }
            return Err(denial.into());
        }
    };

    debug!(
        "Token accepted for {} {} (used {} times)",
        ctx.method, ctx.path, token.used
    );
    ctx.auth = AuthMode::Token {
        token: token.token.clone(),
    };

    if let Some(log) = &state.access_log {
        let entry = AccessLogEntry {
            token: token.token.clone(),
            user: token.user.clone(),
            date_time: Utc::now(),
            method: ctx.method.to_string(),
            bucket: ctx.bucket.clone(),
            path: ctx.path.clone(),
            archive_content: archive.as_ref().map(|manifest| {
                manifest
                    .resolve(&ctx.bucket)
                    .into_iter()
                    .map(|item| format!("{}/{}", item.bucket, item.path.trim_start_matches('/')))
                    .collect()
            }),
        };
        if let Err(e) = log.append(&entry).await {
            warn!("Can't write access log entry: {}", e);
        }
    }

    ctx.archive = archive;
    record_token_use(store.as_ref(), token).await;
    Ok(())
}

/// Count one use of `token`: bump `used`, burn one unit of `count`, and drop
/// the token once it runs out. The read-check-write cycle is not atomic, so
/// concurrent requests with the same token can together exceed `count`.
async fn record_token_use(store: &dyn TokenStore, mut token: CapabilityToken) {
    token.used += 1;
    if let Some(count) = token.count.as_mut() {
        *count -= 1;
        if *count <= 0 && !token.preserve {
            remove_token(store, &token.token).await;
            return;
        }
    }
    if let Err(e) = store.save(&token).await {
        warn!("Can't update token counters: {}", e);
    }
}

async fn remove_token(store: &dyn TokenStore, token: &str) {
    match store.delete(token).await {
        Ok(()) => debug!("Token removed"),
        Err(e) => warn!("Can't remove token: {}", e),
    }
}
