//! Trellis operator - declarative LLM inference serving on Kubernetes

use clap::{Parser, Subcommand};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use trellis_common::crd::{TrellisInferenceConfig, TrellisInferenceService};
use trellis_common::FIELD_MANAGER;
use trellis_operator::config::OperatorConfig;
use trellis_operator::controller_runner::build_inference_controller;

/// Trellis - CRD-driven operator for LLM inference serving
#[derive(Parser, Debug)]
#[command(name = "trellis-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches TrellisInferenceService and TrellisInferenceConfig objects
    /// and converges the serving workloads, router surface, and request
    /// scheduler for each instance.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML
        let service_crd = serde_yaml::to_string(&TrellisInferenceService::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let config_crd = serde_yaml::to_string(&TrellisInferenceConfig::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{service_crd}---\n{config_crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller().await,
    }
}

/// Ensure the Trellis CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply,
/// so the CRD versions always match the operator version. The serving
/// prerequisites (Gateway API, LeaderWorkerSet, InferencePool) belong to
/// the platform and are not touched here.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing TrellisInferenceService CRD...");
    crds.patch(
        "trellisinferenceservices.trellis.dev",
        &params,
        &Patch::Apply(&TrellisInferenceService::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install TrellisInferenceService CRD: {}", e))?;

    tracing::info!("Installing TrellisInferenceConfig CRD...");
    crds.patch(
        "trellisinferenceconfigs.trellis.dev",
        &params,
        &Patch::Apply(&TrellisInferenceConfig::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install TrellisInferenceConfig CRD: {}", e))?;

    tracing::info!("All Trellis CRDs installed/updated");
    Ok(())
}

/// Run in controller mode
async fn run_controller() -> anyhow::Result<()> {
    tracing::info!("Trellis controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Operator installs its own CRDs on startup
    ensure_crds_installed(&client).await?;

    let config = OperatorConfig::from_env();
    tracing::info!(
        system_namespace = %config.system_namespace,
        "Starting Trellis controllers..."
    );

    build_inference_controller(client, config).await;

    tracing::info!("Trellis controller shutting down");
    Ok(())
}
