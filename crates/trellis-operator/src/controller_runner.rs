//! Controller runner - builds the inference controller future
//!
//! Construction is kept separate from startup so the watch graph stays
//! pure and the binary only composes futures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use trellis_common::crd::networking::{InferencePool, LeaderWorkerSet};
use trellis_common::crd::TrellisInferenceService;
use trellis_common::events::{EventPublisher, KubeEventPublisher};
use trellis_common::FIELD_MANAGER;

use crate::config::OperatorConfig;
use crate::controller::{error_policy, reconcile, EngineChildClient, InferenceContext};
use crate::engine::ResourceEngine;

/// Watcher timeout (seconds) - must stay under the client read timeout
/// (30s) so the API server closes idle watches before the client does.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the TrellisInferenceService controller future.
///
/// Owned children whose status feeds instance conditions are watched too,
/// so a Deployment becoming available or a pool being accepted triggers a
/// pass without waiting for the periodic resync.
pub fn build_inference_controller(
    client: Client,
    config: OperatorConfig,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER));
    let child_client = Arc::new(EngineChildClient::new(ResourceEngine::new(
        client.clone(),
        Arc::clone(&events),
    )));
    let ctx = Arc::new(InferenceContext::new(child_client, config, events));

    let instances: Api<TrellisInferenceService> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let worker_sets: Api<LeaderWorkerSet> = Api::all(client.clone());
    let pools: Api<InferencePool> = Api::all(client);

    tracing::info!("- TrellisInferenceService controller");

    Box::pin(
        Controller::new(instances, watch_config())
            .owns(deployments, watch_config())
            .owns(worker_sets, watch_config())
            .owns(pools, watch_config())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("TrellisInferenceService")),
    )
}

fn watch_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(outcome) => {
                tracing::debug!(?outcome, "{} reconciliation completed", controller_name)
            }
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
