//! TrellisInferenceService controller
//!
//! [`client`] is the seam between the reconcile pipeline and the cluster,
//! [`inference`] walks one instance through its children and lifts their
//! readiness into status.

pub mod client;
pub mod inference;

pub use client::{ChildClient, EngineChildClient};
pub use inference::{error_policy, reconcile, InferenceContext};
