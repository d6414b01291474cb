//! Rudder Kube - release engine for Kubernetes
//!
//! This crate provides:
//! - **Actions**: install, upgrade, rollback, uninstall and test, with
//!   automatic rollback and cleanup on failure
//! - **Reconciler**: three-way patching against live objects, batched by
//!   kind, plus readiness and deletion waits
//! - **Hooks**: ordered hook execution with delete and log policies
//! - **Storage**: immutable revision records in Secrets or in memory
//! - **Cluster**: a `ClusterClient` seam over `kube`, with an in-memory mock
//! - **Annotations**: resource policy and ownership, Helm-compatible

pub mod actions;
pub mod annotations;
pub mod builder;
pub mod cluster;
pub mod config;
pub mod error;
pub mod hooks;
pub mod kinds;
pub mod patch;
pub mod reconciler;
pub mod resource;
pub mod storage;

pub use actions::{
    Configuration, InstallOptions, RollbackOptions, TestOptions, UninstallOptions,
    UninstallResponse, UpgradeOptions, validate_release_name,
};
pub use builder::Builder;
pub use cluster::{ClusterClient, KubeCluster, MockCluster};
pub use config::{EngineConfig, RetryConfig};
pub use error::{KubeError, Result};
pub use hooks::HookExecutor;
pub use reconciler::{ReconcileReport, Reconciler, UpdateOptions};
pub use resource::{ResourceInfo, ResourceKey, ResourceList};
pub use storage::{MemoryStore, ReleaseStore, SecretsStore, Storage};
