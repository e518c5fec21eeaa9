//! Shared state and the catch-all proxy handler.
//!
//! Every request goes through the same pipeline: classify, authenticate,
//! then either stream an archive or forward to the backend.

use super::archive;
use super::auth;
use super::classify::{new_request_id, Classifier};
use super::errors::ProxyError;
use super::forward;
use crate::config::{ClientConfig, Config, ConfigError, ProxyMode};
use crate::metrics::Metrics;
use crate::tokens::{open_access_log, open_token_store, AccessLogStore, StoreError, TokenStore};
use crate::types::Rights;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

/// Application state shared across handlers
pub struct AppState {
    pub mode: ProxyMode,
    /// Reported in XML error bodies.
    pub host_id: String,
    pub classifier: Classifier,
    /// API clients by access key id.
    pub clients: HashMap<String, ClientConfig>,
    pub anonymous: Option<Rights>,
    pub tokens: Option<Arc<dyn TokenStore>>,
    pub access_log: Option<Arc<dyn AccessLogStore>>,
    pub http: reqwest::Client,
    pub metrics: Metrics,
}

/// Failures while building [`AppState`].
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Token store: {0}")]
    Store(#[from] StoreError),

    #[error("Bad hostname pattern: {0}")]
    Hostname(#[from] regex::Error),

    #[error("HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

fn random_host_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    format!("host-{}", hex::encode(bytes))
}

impl AppState {
    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        config.validate()?;

        let classifier = Classifier::new(
            &config.hostname,
            config.public_port(),
            config.resolve_targets()?,
        )?;
        let tokens = config.tokens.as_ref().map(open_token_store).transpose()?;
        let access_log = match &config.access_log {
            Some(log) => Some(open_access_log(log).await?),
            None => None,
        };
        // Redirects from a backend go back to the caller untouched.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            mode: config.mode,
            host_id: config.host_id.clone().unwrap_or_else(random_host_id),
            classifier,
            clients: config
                .clients
                .iter()
                .map(|(id, client)| (id.clone(), client.clone()))
                .collect(),
            anonymous: config.anonymous.clone(),
            tokens,
            access_log,
            http,
            metrics: Metrics::new(),
        })
    }

    /// Log and render a rejection.
    fn reject(&self, error: &ProxyError, bucket: Option<&str>, request_id: &str) -> Response {
        match error {
            ProxyError::Unauthorized(_) | ProxyError::Forbidden(_) => {
                self.metrics
                    .auth_failures_total
                    .with_label_values(&[error.kind()])
                    .inc();
                info!("{}", error.diagnostic());
            }
            ProxyError::Internal(_) | ProxyError::Backend(_) => warn!("{}", error.diagnostic()),
            _ => debug!("{}", error.diagnostic()),
        }
        error.render(bucket, request_id, &self.host_id)
    }
}

/// Catch-all handler: every path and method ends up here.
pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request_id = new_request_id();
    let span = info_span!("request", id = %request_id);
    handle(state, request_id, request).instrument(span).await
}

async fn handle(state: Arc<AppState>, request_id: String, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    debug!("{} {}", parts.method, parts.uri);

    let mut ctx = match state
        .classifier
        .classify(request_id.clone(), &parts.method, &parts.uri, &parts.headers)
    {
        Ok(ctx) => ctx,
        Err(e) => return state.reject(&e, None, &request_id),
    };

    if let Err(e) = auth::authenticate(&state, &mut ctx, &parts).await {
        return state.reject(&e, Some(&ctx.bucket), &request_id);
    }

    if let Some(manifest) = ctx.archive.take() {
        return archive::stream_archive(state.clone(), &ctx, &manifest);
    }

    match forward::forward(&state, &ctx, &parts.headers, body).await {
        Ok(response) => response,
        Err(e) => state.reject(&e, Some(&ctx.bucket), &request_id),
    }
}
