//! Minimal Elasticsearch client.
//!
//! Only the handful of APIs the pipeline needs: single-document
//! GET/PUT/DELETE/HEAD, index/mapping management, and the newline-delimited
//! `_bulk` endpoint. Knows nothing about the source side.

pub mod bulk;
pub mod client;

pub use bulk::{BulkAction, BulkRequest, BulkResponse, BulkResponseItem};
pub use client::{Client, ClientConfig, DocResponse};
