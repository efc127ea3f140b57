//! Custom Resource Definitions for Trellis
//!
//! `inference_service` defines the CRDs this operator owns. `networking`
//! holds typed bindings for the foreign CRDs it writes (Gateway API routes,
//! inference pools, LeaderWorkerSets) whose definitions are installed by
//! their own projects.

mod inference_service;
pub mod networking;

pub use inference_service::{
    merge_specs, BaseRef, Criticality, GatewayRef, GatewaySpec, ModelSpec, ParallelismSpec,
    PoolMigration, RouteSpec, RouterSpec, SchedulerConfigRef, SchedulerConfigSpec, SchedulerSpec,
    StorageInitializerSpec, TrellisInferenceConfig, TrellisInferenceConfigSpec,
    TrellisInferenceService, TrellisInferenceServiceSpec, TrellisInferenceServiceStatus,
    WorkloadSpec, CONDITION_MAIN_WORKLOAD_READY, CONDITION_PREFILL_WORKLOAD_READY,
    CONDITION_READY, CONDITION_ROUTER_READY, CONDITION_SCHEDULER_READY,
};
