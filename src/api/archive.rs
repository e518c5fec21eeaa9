//! ZIP fan-out: one archive token, many backend objects, one streamed ZIP.
//!
//! The 200 and its headers go out before the first backend request, so a
//! failing entry can only end the archive early. The central directory is
//! still written in that case and the download is a valid, shorter ZIP.

use super::classify::RequestContext;
use super::forward::{BackendCall, OutboundCarrier};
use super::handlers::AppState;
use crate::types::{ArchiveItem, ArchiveManifest};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::io::{self, Seek, Write};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// ZIP chunks buffered between the writer task and the client.
const CHANNEL_DEPTH: usize = 8;

type Chunk = Result<Bytes, io::Error>;

#[derive(Debug, Error)]
enum ArchiveError {
    #[error("no backend for bucket {0}")]
    NoTarget(String),

    #[error("can't sign request: {0}")]
    Signing(String),

    #[error("backend request failed: {0}")]
    Backend(#[from] reqwest::Error),

    #[error("backend returned {status} for {bucket}{path}")]
    Status {
        status: StatusCode,
        bucket: String,
        path: String,
    },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("write error: {0}")]
    Io(#[from] io::Error),

    #[error("client went away")]
    Cancelled,
}

/// `Write` sink whose bytes are drained into the response stream after each
/// write to the `ZipWriter`.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn content_disposition(filename: &str) -> HeaderValue {
    let cleaned: String = filename.chars().filter(|c| *c != '"').collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", cleaned))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"archive.zip\""))
}

/// Start the archive download for a request a token resolved to `manifest`.
pub fn stream_archive(state: Arc<AppState>, ctx: &RequestContext, manifest: &ArchiveManifest) -> Response {
    let items = manifest.resolve(&ctx.bucket);
    info!(
        "Archive {} with {} entries for bucket {}",
        manifest.download_name(),
        items.len(),
        ctx.bucket
    );

    let body = if ctx.method == Method::HEAD {
        Body::empty()
    } else {
        let (tx, rx) = mpsc::channel::<Chunk>(CHANNEL_DEPTH);
        let cancel = CancellationToken::new();
        // Dropping the body (client gone) cancels the writer task.
        let guard = cancel.clone().drop_guard();
        tokio::spawn(write_archive(state, items, tx, cancel).in_current_span());

        let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|chunk| (chunk, (rx, guard)))
        });
        Body::from_stream(stream)
    };

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&manifest.download_name()),
    );
    response
}

async fn write_archive(
    state: Arc<AppState>,
    items: Vec<ArchiveItem>,
    tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) {
    let sink = SharedBuffer::default();
    let mut zip = ZipWriter::new_stream(sink.clone());

    match append_entries(&state, &items, &mut zip, &sink, &tx, &cancel).await {
        Ok(count) => debug!("Archive complete, {} entries", count),
        Err(ArchiveError::Cancelled) => {
            debug!("Archive download abandoned by client");
            return;
        }
        Err(e) => warn!("Archive cut short: {}", e),
    }

    if let Err(e) = zip.finish() {
        warn!("Can't finish archive: {}", e);
        return;
    }
    if flush(&state, &sink, &tx).await.is_err() {
        debug!("Client went away before the archive trailer");
    }
}

/// Fetch every entry in order and append it to the archive.
async fn append_entries<W: Write + Seek>(
    state: &AppState,
    items: &[ArchiveItem],
    zip: &mut ZipWriter<W>,
    sink: &SharedBuffer,
    tx: &mpsc::Sender<Chunk>,
    cancel: &CancellationToken,
) -> Result<usize, ArchiveError> {
    let no_headers = HeaderMap::new();

    for item in items {
        let target = state
            .classifier
            .targets()
            .get(&item.bucket)
            .ok_or_else(|| ArchiveError::NoTarget(item.bucket.clone()))?;
        let call = BackendCall {
            target: &target,
            bucket: &item.bucket,
            method: &Method::GET,
            path: &item.path,
            query: &[],
            headers: &no_headers,
            carrier: OutboundCarrier::Header,
        };
        let request = call
            .prepare(Utc::now())
            .map_err(|e| ArchiveError::Signing(e.to_string()))?;

        let send = state
            .http
            .request(request.method, &request.url)
            .headers(request.headers)
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            response = send => response?,
        };
        if response.status() != StatusCode::OK {
            return Err(ArchiveError::Status {
                status: response.status(),
                bucket: item.bucket.clone(),
                path: item.path.clone(),
            });
        }

        let large = response
            .content_length()
            .is_some_and(|len| len >= u64::from(u32::MAX));
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(large);
        zip.start_file(item.name.as_str(), options)?;

        let mut body = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            zip.write_all(&chunk?)?;
            flush(state, sink, tx).await?;
        }

        state.metrics.archive_entries_total.inc();
        debug!("Added {}/{} as {}", item.bucket, item.path.trim_start_matches('/'), item.name);
    }

    Ok(items.len())
}

/// Move whatever the writer produced so far into the response.
async fn flush(state: &AppState, sink: &SharedBuffer, tx: &mpsc::Sender<Chunk>) -> Result<(), ArchiveError> {
    let pending = sink.take();
    if pending.is_empty() {
        return Ok(());
    }
    state.metrics.download_bytes_total.inc_by(pending.len() as u64);
    tx.send(Ok(Bytes::from(pending)))
        .await
        .map_err(|_| ArchiveError::Cancelled)
}
