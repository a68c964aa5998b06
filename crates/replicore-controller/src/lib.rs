//! # Replicore Controller
//!
//! Controller-side services of the replication control plane: the request
//! and job families with their state machines, the per-worker messenger,
//! the management side-channel and the REST ingress.

pub mod controller;
pub mod http;
pub mod jobs;
pub mod messenger;
pub mod requests;
pub mod service_provider;
pub mod worker_mgt;
