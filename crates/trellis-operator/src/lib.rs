//! Trellis Kubernetes operator for declarative LLM inference services

#![deny(missing_docs)]

/// Operator configuration from environment variables
pub mod config;
/// Controller runtime wiring and the reconcile pipeline
pub mod controller;
/// Builds the controller future over the watch graph
pub mod controller_runner;
/// Generic ownership-checked CRUD engine for child resources
pub mod engine;
/// Managed service-account lifecycle per serving role
pub mod identity;
/// Workload Service, TLS secret, and HTTPRoute management
pub mod router;
/// Endpoint-picker scheduler children and inference pools
pub mod scheduler;
/// Model-artifact attachment per storage backend
pub mod storage;
/// Serving workload construction (Deployment and LeaderWorkerSet)
pub mod workload;

pub use trellis_common::{Error, Result};
