//! Release orchestrators
//!
//! Every operation follows the same shape: prepare (render and diff, no
//! cluster mutation), persist a pending revision, execute (hooks,
//! reconcile, wait), then finalize the revision's status. The
//! orchestrators are the only layer that decides a release's terminal
//! status or compensates for a failure.

mod install;
mod query;
mod rollback;
mod testing;
mod uninstall;
mod upgrade;

#[cfg(test)]
pub(crate) mod testutil;

pub use install::InstallOptions;
pub use rollback::RollbackOptions;
pub use testing::TestOptions;
pub use uninstall::{UninstallOptions, UninstallResponse};
pub use upgrade::UpgradeOptions;

use std::future::Future;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use kube::api::PropagationPolicy;
use regex::Regex;
use rudder_core::{
    Chart, Clock, Hook, PassthroughRenderer, Release, Renderer, SystemClock, Values, join_manifests,
    sort_manifests,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::annotations;
use crate::builder::Builder;
use crate::cluster::{ClusterClient, KubeCluster};
use crate::config::EngineConfig;
use crate::error::{KubeError, Result};
use crate::hooks::HookExecutor;
use crate::reconciler::Reconciler;
use crate::resource::ResourceList;
use crate::storage::{SecretsStore, Storage};

/// Maximum release name length; names end up in resource names and labels
pub const MAX_RELEASE_NAME_LEN: usize = 53;

static RELEASE_NAME: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$"));

/// Check a release name: a DNS-1123 label of at most 53 characters
pub fn validate_release_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| KubeError::InvalidReleaseName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is required"));
    }
    if name.len() > MAX_RELEASE_NAME_LEN {
        return Err(invalid("name must be at most 53 characters"));
    }
    let pattern = RELEASE_NAME
        .as_ref()
        .map_err(|e| KubeError::InvalidConfig(e.to_string()))?;
    if !pattern.is_match(name) {
        return Err(invalid(
            "must consist of lower case alphanumeric characters or '-', and start and end with an alphanumeric character",
        ));
    }
    Ok(())
}

/// Rendered chart split into what a revision records
pub(crate) struct Rendered {
    pub manifest: String,
    pub hooks: Vec<Hook>,
    pub notes: Option<String>,
}

/// Collaborators shared by every orchestrator
///
/// The clock and the manager identity are explicit so tests can pin them.
#[derive(Clone)]
pub struct Configuration {
    pub storage: Storage,
    pub cluster: Arc<dyn ClusterClient>,
    pub renderer: Arc<dyn Renderer>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

impl Configuration {
    pub fn new(
        storage: Storage,
        cluster: Arc<dyn ClusterClient>,
        renderer: Arc<dyn Renderer>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            cluster,
            renderer,
            clock,
            config,
        }
    }

    /// Connect to the default cluster, storing releases as Secrets in
    /// `storage_namespace`
    pub async fn connect(config: EngineConfig, storage_namespace: &str) -> Result<Self> {
        config.validate()?;
        let cluster = KubeCluster::try_default(config.manager.clone()).await?;
        let store = SecretsStore::new(cluster.client().clone(), storage_namespace)
            .with_owner(config.manager.clone());
        Ok(Self::new(
            Storage::new(Arc::new(store), config.manager.clone()),
            Arc::new(cluster),
            Arc::new(PassthroughRenderer),
            Arc::new(SystemClock),
            config,
        ))
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.cluster.clone(), self.config.clone())
    }

    pub fn hook_executor(&self) -> HookExecutor {
        HookExecutor::new(
            self.cluster.clone(),
            self.reconciler(),
            self.storage.clone(),
            self.clock.clone(),
        )
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Builder that stamps `release` ownership onto its objects
    pub(crate) fn builder(&self, release: &Release) -> Builder {
        Builder::new(self.cluster.clone(), release.namespace.clone())
            .with_owner(release.name.clone(), self.config.manager.clone())
    }

    /// Build a revision's manifest; an empty manifest is an empty list
    pub(crate) fn build(&self, release: &Release, validate: bool) -> Result<ResourceList> {
        match self.builder(release).build(&release.manifest, validate) {
            Err(KubeError::NoObjectsVisited) => Ok(ResourceList::new()),
            other => other,
        }
    }

    /// Render `chart` with its defaults overlaid by `values`
    pub(crate) fn render(&self, chart: &Chart, values: &Values) -> Result<Rendered> {
        let mut effective = chart.values.clone();
        effective.merge(values);

        let files = self.renderer.render(chart, &effective)?;
        let sorted = sort_manifests(&files)?;
        Ok(Rendered {
            manifest: join_manifests(&sorted.manifests),
            hooks: sorted.hooks,
            notes: sorted.notes,
        })
    }

    /// Fail if another operation owns the latest revision
    pub(crate) fn ensure_not_pending(&self, latest: &Release) -> Result<()> {
        if latest.status().is_pending() {
            return Err(KubeError::OperationInProgress {
                name: latest.name.clone(),
                status: latest.status().to_string(),
            });
        }
        Ok(())
    }

    /// Refuse to take over live objects another owner manages
    pub(crate) async fn check_ownership(
        &self,
        release: &Release,
        resources: &ResourceList,
    ) -> Result<ResourceList> {
        let mut adopted = ResourceList::new();
        let mut errors = Vec::new();
        for info in resources {
            let Some(live) = self.cluster.get(info).await? else {
                continue;
            };
            match annotations::check_owner(
                &live,
                &release.name,
                &release.namespace,
                &self.config.manager,
            ) {
                Ok(()) => adopted.push(info.clone()),
                Err(reason) => errors.push(KubeError::ResourceConflict {
                    resource: info.to_string(),
                    reason,
                }),
            }
        }
        match KubeError::join(errors) {
            Some(e) => Err(e),
            None => Ok(adopted),
        }
    }

    /// Store a revision after the cluster already changed; failures are logged
    pub(crate) async fn persist(&self, release: &Release) {
        if let Err(e) = self.storage.update(release).await {
            tracing::warn!(
                release = %release.name,
                revision = release.version,
                status = %release.status(),
                error = %e,
                "failed to update release record"
            );
        }
    }

    /// Mark every other deployed revision superseded
    pub(crate) async fn supersede_deployed(&self, release: &Release) {
        let deployed = match self.storage.deployed_all(&release.name).await {
            Ok(deployed) => deployed,
            Err(e) => {
                tracing::warn!(release = %release.name, error = %e, "failed to list deployed revisions");
                return;
            }
        };
        for mut previous in deployed.into_iter().filter(|r| r.version != release.version) {
            let description = format!("Superseded by revision {}", release.version);
            match previous.transition(rudder_core::Status::Superseded, description, self.now()) {
                Ok(()) => self.persist(&previous).await,
                Err(e) => tracing::warn!(release = %release.name, error = %e, "cannot supersede revision"),
            }
        }
    }

    /// Delete what a failed attempt created; returns the cleanup error, if any
    pub(crate) async fn cleanup_created(&self, created: &ResourceList) -> Option<KubeError> {
        if created.is_empty() {
            return None;
        }
        tracing::info!(resources = ?created.names(), "cleaning up resources created by failed operation");
        // Fresh scope: cleanup still runs after the caller cancelled
        let mut report = self
            .reconciler()
            .delete_unless_kept(
                &created.reversed(),
                PropagationPolicy::Background,
                &CancellationToken::new(),
            )
            .await;
        let err = report.take_error();
        if let Some(e) = &err {
            tracing::warn!(error = %e, "cleanup after failure was incomplete");
        }
        err
    }

    /// Prune history after a successful operation; failures are logged
    pub(crate) async fn prune_history(&self, name: &str, max_history: Option<usize>) {
        let max = max_history.unwrap_or(self.config.max_history);
        if let Err(e) = self.storage.prune(name, max).await {
            tracing::warn!(release = %name, error = %e, "failed to prune release history");
        }
    }
}

/// Run an execute phase on its own task, racing it against `cancel`
///
/// The task owns the release record while it runs. When `cancel` fires
/// first, the task is still awaited so that its failure bookkeeping
/// finishes before `Cancelled` is returned.
pub(crate) async fn run_detached<F>(task: F, cancel: &CancellationToken) -> Result<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, mut rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tx.send(task.await);
    });

    tokio::select! {
        outcome = &mut rx => outcome.unwrap_or_else(|_| {
            Err(KubeError::Internal(
                "execute task ended without reporting a result".to_string(),
            ))
        }),
        _ = cancel.cancelled() => {
            tracing::warn!("operation cancelled, waiting for in-flight changes to settle");
            let _ = (&mut rx).await;
            Err(KubeError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_release_name() {
        assert!(validate_release_name("r1").is_ok());
        assert!(validate_release_name("my-app-2").is_ok());
        assert!(validate_release_name(&"a".repeat(53)).is_ok());

        for bad in ["", "-app", "app-", "My-App", "app_1", "app.v1"] {
            assert!(
                matches!(validate_release_name(bad), Err(KubeError::InvalidReleaseName { .. })),
                "{bad} should be rejected"
            );
        }
        assert!(validate_release_name(&"a".repeat(54)).is_err());
    }

    #[tokio::test]
    async fn test_run_detached_reports_result() {
        let cancel = CancellationToken::new();
        assert!(run_detached(async { Ok(()) }, &cancel).await.is_ok());

        let err = run_detached(async { Err(KubeError::Storage("boom".into())) }, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::Storage(_)));
    }

    #[tokio::test]
    async fn test_run_detached_panic_is_not_cancellation() {
        let cancel = CancellationToken::new();
        let task = async { Option::<Result<()>>::None.expect("execute exploded") };

        let err = run_detached(task, &cancel).await.unwrap_err();
        assert!(matches!(err, KubeError::Internal(_)));
        assert!(!err.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_detached_waits_for_task_after_cancel() {
        let cancel = CancellationToken::new();
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = finished.clone();
        let child = cancel.child_token();

        let task = async move {
            child.cancelled().await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        };
        cancel.cancel();

        let err = run_detached(task, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
    }
}
