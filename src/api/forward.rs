//! Single-object forwarding: rebuild the request for the backend, sign it
//! with the backend's credentials and stream both bodies through.

use super::classify::{AuthMode, RequestContext};
use super::errors::ProxyError;
use super::handlers::AppState;
use crate::config::BucketTarget;
use crate::metrics::Metrics;
use crate::sigv4::{
    self, CredentialScope, SigningParams, SigningRequest, UNSIGNED_PAYLOAD, X_AMZ_CONTENT_SHA256,
    X_AMZ_DATE,
};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tracing::{debug, warn, Level};

/// Inbound headers copied to the backend request.
const FORWARDED_HEADERS: [&str; 6] = [
    "content-length",
    "content-type",
    "content-md5",
    "accept-encoding",
    X_AMZ_CONTENT_SHA256,
    "x-amz-acl",
];

/// Forwarded but left out of the signature.
const UNSIGNED_HEADERS: [&str; 2] = ["content-length", "accept-encoding"];

/// Inbound query keys copied to the backend request.
const FORWARDED_QUERY: [&str; 3] = ["delimiter", "max-keys", "prefix"];

/// Backend response headers that describe the backend connection, not the object.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client errors with bodies up to this size are buffered and logged.
const LOGGED_ERROR_BODY_LIMIT: u64 = 2000;

/// Which carrier the backend signature goes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundCarrier {
    Header,
    Presigned { expires: u64 },
}

impl From<&AuthMode> for OutboundCarrier {
    fn from(auth: &AuthMode) -> Self {
        match auth {
            AuthMode::QuerySigned { expires } => OutboundCarrier::Presigned { expires: *expires },
            _ => OutboundCarrier::Header,
        }
    }
}

fn is_forwarded_header(name: &str) -> bool {
    FORWARDED_HEADERS.contains(&name) || name.starts_with("x-amz-meta-")
}

/// One request to send to a backend.
pub struct BackendCall<'a> {
    pub target: &'a BucketTarget,
    pub bucket: &'a str,
    pub method: &'a Method,
    /// Decoded object path inside the bucket.
    pub path: &'a str,
    pub query: &'a [(String, String)],
    /// Inbound headers; only the allow-listed ones are used.
    pub headers: &'a HeaderMap,
    pub carrier: OutboundCarrier,
}

/// A signed request ready to hand to the HTTP client.
#[derive(Debug)]
pub struct BackendRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

impl BackendCall<'_> {
    pub fn prepare(&self, now: DateTime<Utc>) -> Result<BackendRequest, ProxyError> {
        let amz_date = sigv4::format_amz_date(now);

        let mut forwarded: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(name, _)| is_forwarded_header(name.as_str()))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let payload_hash = match self.carrier {
            OutboundCarrier::Header => {
                let hash = forwarded
                    .iter()
                    .find(|(name, _)| name == X_AMZ_CONTENT_SHA256)
                    .map(|(_, value)| value.clone())
                    .unwrap_or_else(|| UNSIGNED_PAYLOAD.to_string());
                forwarded.retain(|(name, _)| name != X_AMZ_CONTENT_SHA256);
                forwarded.push((X_AMZ_CONTENT_SHA256.to_string(), hash.clone()));
                forwarded.push((X_AMZ_DATE.to_string(), amz_date.clone()));
                hash
            }
            OutboundCarrier::Presigned { .. } => UNSIGNED_PAYLOAD.to_string(),
        };

        let signed: Vec<(String, String)> = forwarded
            .iter()
            .filter(|(name, _)| !UNSIGNED_HEADERS.contains(&name.as_str()))
            .cloned()
            .collect();
        let query: Vec<(String, String)> = self
            .query
            .iter()
            .filter(|(key, _)| FORWARDED_QUERY.contains(&key.as_str()))
            .cloned()
            .collect();

        let host = self.target.host_for(self.bucket);
        let backend_path = self.target.path_for(self.bucket, self.path);
        let request = SigningRequest {
            method: self.method.as_str(),
            host: &host,
            path: &backend_path,
            query: &query,
            headers: &signed,
            payload_hash: &payload_hash,
        };
        let params = SigningParams {
            access_key_id: &self.target.access_key_id,
            secret_access_key: &self.target.secret_access_key,
            scope: CredentialScope::new(&amz_date, &self.target.region, "s3"),
            amz_date: &amz_date,
        };

        let mut headers = HeaderMap::new();
        let query = match self.carrier {
            OutboundCarrier::Header => {
                let authorization = sigv4::authorization_header(&request, &params);
                headers.insert(header::AUTHORIZATION, header_value(&authorization)?);
                query
            }
            OutboundCarrier::Presigned { expires } => {
                sigv4::presigned_query(&request, &params, expires)
            }
        };
        for (name, value) in &forwarded {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ProxyError::Internal(format!("Bad header name {}: {}", name, e)))?;
            headers.append(name, header_value(value)?);
        }

        Ok(BackendRequest {
            method: self.method.clone(),
            url: self.target.url_for(
                self.bucket,
                &sigv4::uri_encode_path(&backend_path),
                &sigv4::encode_query(&query),
            ),
            headers,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value)
        .map_err(|e| ProxyError::Internal(format!("Bad header value: {}", e)))
}

fn has_body(headers: &HeaderMap) -> bool {
    headers.contains_key(header::TRANSFER_ENCODING)
        || headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .is_some_and(|len| len > 0)
}

/// Forward the request and relay the backend's answer, whatever its status.
pub async fn forward(
    state: &AppState,
    ctx: &RequestContext,
    inbound: &HeaderMap,
    body: Body,
) -> Result<Response, ProxyError> {
    let call = BackendCall {
        target: &ctx.target,
        bucket: &ctx.bucket,
        method: &ctx.method,
        path: &ctx.path,
        query: &ctx.query,
        headers: inbound,
        carrier: OutboundCarrier::from(&ctx.auth),
    };
    let backend = call.prepare(Utc::now())?;
    debug!("Forwarding {} {}", backend.method, backend.url);

    let mut request = state
        .http
        .request(backend.method, &backend.url)
        .headers(backend.headers);
    if has_body(inbound) {
        let uploaded = state.metrics.upload_bytes_total.clone();
        let stream = body
            .into_data_stream()
            .inspect_ok(move |chunk| uploaded.inc_by(chunk.len() as u64));
        request = request.body(reqwest::Body::wrap_stream(stream));
    }

    let response = request.send().await.map_err(|e| {
        warn!("Backend request failed: {}", e);
        ProxyError::Backend(format!("Backend request failed: {}", e))
    })?;
    debug!("Backend replied {}", response.status());

    Ok(relay(response, &state.metrics).await)
}

/// Turn a backend response into the caller's response. Status and headers
/// are fixed before the first body byte is sent.
async fn relay(response: reqwest::Response, metrics: &Metrics) -> Response {
    let status = response.status();
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let small_error = status.is_client_error()
        && response
            .content_length()
            .is_some_and(|len| len < LOGGED_ERROR_BODY_LIMIT);

    let body = if small_error && tracing::enabled!(Level::DEBUG) {
        match response.bytes().await {
            Ok(bytes) => {
                debug!("Backend error body: {}", String::from_utf8_lossy(&bytes));
                metrics.download_bytes_total.inc_by(bytes.len() as u64);
                Body::from(bytes)
            }
            Err(e) => {
                warn!("Can't read backend error body: {}", e);
                headers.remove(header::CONTENT_LENGTH);
                Body::empty()
            }
        }
    } else {
        let downloaded = metrics.download_bytes_total.clone();
        Body::from_stream(
            response
                .bytes_stream()
                .inspect_ok(move |chunk| downloaded.inc_by(chunk.len() as u64)),
        )
    };

    let mut reply = Response::new(body);
    *reply.status_mut() = status;
    *reply.headers_mut() = headers;
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigv4::{AuthCarrier, InboundRequest};

    fn target(path_style: bool) -> BucketTarget {
        BucketTarget {
            scheme: "http".into(),
            authority: "backend.test:9000".into(),
            access_key_id: "BACKENDKEY".into(),
            secret_access_key: "backend-secret".into(),
            region: "eu-west-1".into(),
            path_style,
        }
    }

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("photos.gate.test"));
        headers.insert("authorization", HeaderValue::from_static("AWS4-HMAC-SHA256 caller"));
        headers.insert("cookie", HeaderValue::from_static("session=1"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.insert("content-type", HeaderValue::from_static("image/jpeg"));
        headers.insert("content-length", HeaderValue::from_static("5"));
        headers.insert("x-amz-meta-owner", HeaderValue::from_static("alice"));
        headers.insert(X_AMZ_DATE, HeaderValue::from_static("20000101T000000Z"));
        headers
    }

    fn query() -> Vec<(String, String)> {
        vec![
            ("prefix".into(), "2024/".into()),
            ("token".into(), "secret-token".into()),
            ("X-Amz-Signature".into(), "caller".into()),
        ]
    }

    /// Verify a prepared request the way a backend would.
    fn backend_accepts(request: &BackendRequest, secret: &str) -> bool {
        let url = reqwest::Url::parse(&request.url).unwrap();
        let mut headers = request.headers.clone();
        let host = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap(), port),
            None => url.host_str().unwrap().to_string(),
        };
        headers.insert("host", HeaderValue::from_str(&host).unwrap());
        let query = sigv4::decode_query(url.query().unwrap_or(""));
        let carrier = AuthCarrier::from_request(&headers, &query).unwrap().unwrap();
        let inbound = InboundRequest {
            method: request.method.as_str(),
            raw_path: url.path(),
            raw_query: url.query(),
            headers: &headers,
        };
        let expected = sigv4::expected_signature(&carrier, &inbound, secret).unwrap();
        sigv4::signatures_match(&expected, &carrier.parsed().signature)
    }

    #[test]
    fn test_header_mode_allow_list_and_signature() {
        let target = target(false);
        let headers = inbound();
        let query = query();
        let call = BackendCall {
            target: &target,
            bucket: "photos",
            method: &Method::PUT,
            path: "/2024/a b.jpg",
            query: &query,
            headers: &headers,
            carrier: OutboundCarrier::Header,
        };
        let now = Utc::now();
        let request = call.prepare(now).unwrap();

        assert_eq!(
            request.url,
            "http://photos.backend.test:9000/2024/a%20b.jpg?prefix=2024%2F"
        );
        assert!(request.headers.get("cookie").is_none());
        assert!(request.headers.get("x-forwarded-for").is_none());
        assert!(request.headers.get("host").is_none());
        assert_eq!(request.headers["x-amz-meta-owner"], "alice");
        assert_eq!(request.headers["content-length"], "5");
        assert_eq!(request.headers[X_AMZ_CONTENT_SHA256], UNSIGNED_PAYLOAD);
        assert_eq!(
            request.headers[X_AMZ_DATE].to_str().unwrap(),
            sigv4::format_amz_date(now)
        );
        let authorization = request.headers[header::AUTHORIZATION].to_str().unwrap();
        assert!(authorization.contains("Credential=BACKENDKEY/"));
        assert!(authorization.contains("/eu-west-1/s3/aws4_request"));
        assert!(authorization.contains("SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date;x-amz-meta-owner,"));

        assert!(backend_accepts(&request, "backend-secret"));
        assert!(!backend_accepts(&request, "caller-secret"));
    }

    #[test]
    fn test_presigned_mode() {
        let target = target(true);
        let headers = HeaderMap::new();
        let query = query();
        let call = BackendCall {
            target: &target,
            bucket: "photos",
            method: &Method::GET,
            path: "/a.jpg",
            query: &query,
            headers: &headers,
            carrier: OutboundCarrier::Presigned { expires: 300 },
        };
        let request = call.prepare(Utc::now()).unwrap();

        assert!(request.url.starts_with("http://backend.test:9000/photos/a.jpg?prefix=2024%2F&X-Amz-Algorithm="));
        assert!(request.url.contains("X-Amz-Expires=300"));
        assert!(!request.url.contains("token="));
        assert!(!request.url.contains("caller"));
        assert!(request.headers.get(header::AUTHORIZATION).is_none());
        assert!(backend_accepts(&request, "backend-secret"));
    }

    #[test]
    fn test_payload_hash_is_kept() {
        let target = target(false);
        let mut headers = HeaderMap::new();
        headers.insert(
            X_AMZ_CONTENT_SHA256,
            HeaderValue::from_static("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"),
        );
        let call = BackendCall {
            target: &target,
            bucket: "photos",
            method: &Method::PUT,
            path: "/hello.txt",
            query: &[],
            headers: &headers,
            carrier: OutboundCarrier::Header,
        };
        let request = call.prepare(Utc::now()).unwrap();
        assert_eq!(request.headers.get_all(X_AMZ_CONTENT_SHA256).iter().count(), 1);
        assert!(request.headers[X_AMZ_CONTENT_SHA256]
            .to_str()
            .unwrap()
            .starts_with("2cf24dba"));
        assert!(backend_accepts(&request, "backend-secret"));
    }

    #[test]
    fn test_has_body() {
        let mut headers = HeaderMap::new();
        assert!(!has_body(&headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!has_body(&headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert!(has_body(&headers));
    }
}
