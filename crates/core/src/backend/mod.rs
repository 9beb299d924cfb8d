//! Remote image search/download service.
//!
//! This module provides an `ImageBackend` trait covering the HTTP surface the
//! acquisition session consumes (CSV parsing, search, reprocess, background
//! download jobs, archive retrieval, cleanup) and a reqwest implementation.

mod http;
mod types;

pub use http::HttpImageBackend;
pub use types::*;
