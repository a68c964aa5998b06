//! # Replicore Worker
//!
//! Storage-worker services of the replication control plane: the wire
//! server and request processor, the asynchronous ingest manager with its
//! boot-time recovery, and the ingest HTTP surface.

pub mod context;
pub mod fetcher;
pub mod http;
pub mod ingest;
pub mod processor;
pub mod requests;
pub mod server;
pub mod sql_backend;
