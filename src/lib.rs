//! s3gate - authorizing, re-signing reverse proxy for S3-compatible storage
//!
//! Callers authenticate either with their own SigV4 credentials (S3 mode)
//! or with a capability token in the query string (web mode). Accepted
//! requests are re-signed with the backend's credentials and streamed
//! through; archive tokens fan out into a single streamed ZIP.

pub mod api;
pub mod config;
pub mod metrics;
pub mod sigv4;
pub mod tokens;
pub mod types;
