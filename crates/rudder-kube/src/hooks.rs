//! Hook execution
//!
//! Runs the hooks of a release for one event, in `(weight, name)` order:
//! - prior resources are removed first under `before-hook-creation`
//! - each hook is created and waited on to completion
//! - the first failure aborts the event
//! - `hook-succeeded` / `hook-failed` delete and log policies are applied
//!
//! The release record is persisted whenever a hook changes phase so an
//! interrupted run stays visible in the store.

use std::sync::Arc;
use std::time::Duration;

use kube::api::PropagationPolicy;
use rudder_core::hook::execution_order;
use rudder_core::{
    Clock, Hook, HookDeletePolicy, HookEvent, HookExecution, HookOutputLogPolicy, HookPhase, Release,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::builder::Builder;
use crate::cluster::ClusterClient;
use crate::error::{KubeError, Result};
use crate::reconciler::Reconciler;
use crate::resource::ResourceList;
use crate::storage::Storage;

/// Executes release hooks against a cluster
#[derive(Clone)]
pub struct HookExecutor {
    cluster: Arc<dyn ClusterClient>,
    reconciler: Reconciler,
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl HookExecutor {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        reconciler: Reconciler,
        storage: Storage,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cluster,
            reconciler,
            storage,
            clock,
        }
    }

    /// Run every hook of `release` registered for `event`
    ///
    /// `timeout` bounds the whole event. Hook phases, timestamps and
    /// captured logs are written into `release.hooks`.
    pub async fn execute(
        &self,
        release: &mut Release,
        event: HookEvent,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.execute_filtered(release, event, timeout, cancel, |_| true)
            .await
    }

    /// Run the hooks for `event` that `select` accepts
    pub async fn execute_filtered(
        &self,
        release: &mut Release,
        event: HookEvent,
        timeout: Duration,
        cancel: &CancellationToken,
        select: impl Fn(&Hook) -> bool + Send,
    ) -> Result<()> {
        let order: Vec<usize> = execution_order(&release.hooks, event)
            .into_iter()
            .filter(|&i| select(&release.hooks[i]))
            .collect();
        if order.is_empty() {
            return Ok(());
        }

        tracing::info!(
            release = %release.name,
            revision = release.version,
            %event,
            hooks = order.len(),
            "running hooks"
        );

        let deadline = Instant::now() + timeout;
        let builder = Builder::new(self.cluster.clone(), release.namespace.clone());
        let mut executed: Vec<(usize, ResourceList)> = Vec::with_capacity(order.len());

        for index in order {
            let resources = builder
                .build(&release.hooks[index].manifest, true)
                .map_err(|e| self.failure(release, index, event, e))?;

            if release.hooks[index].has_delete_policy(HookDeletePolicy::BeforeHookCreation) {
                self.delete_resources(&resources, remaining(deadline), cancel)
                    .await
                    .map_err(|e| self.failure(release, index, event, e))?;
            }

            release.hooks[index].last_run = HookExecution {
                started_at: Some(self.clock.now()),
                completed_at: None,
                phase: HookPhase::Running,
                log: None,
            };
            self.persist(release).await;
            tracing::debug!(hook = %release.hooks[index].name, %event, "hook started");

            let mut report = self.reconciler.create(&resources, cancel).await;
            if let Some(err) = report.take_error() {
                self.finish(release, index, HookPhase::Failed).await;
                return Err(self.failure(release, index, event, err));
            }

            let waited = self
                .reconciler
                .wait_for_completion(&resources, remaining(deadline), cancel)
                .await;
            if let Err(err) = waited {
                self.on_failure(release, index, &resources, cancel).await;
                return Err(self.failure(release, index, event, err));
            }

            self.finish(release, index, HookPhase::Succeeded).await;
            tracing::debug!(hook = %release.hooks[index].name, %event, "hook succeeded");
            executed.push((index, resources));
        }

        for (index, resources) in executed.iter().rev() {
            let hook = &release.hooks[*index];
            if hook.has_output_log_policy(HookOutputLogPolicy::HookSucceeded) {
                let log = self.capture_logs(resources).await;
                release.hooks[*index].last_run.log = log;
            }
            if release.hooks[*index].has_delete_policy(HookDeletePolicy::HookSucceeded) {
                self.delete_resources(resources, remaining(deadline), cancel)
                    .await
                    .map_err(|e| self.failure(release, *index, event, e))?;
            }
        }
        self.persist(release).await;

        tracing::info!(release = %release.name, %event, "hooks completed");
        Ok(())
    }

    /// Record a failed hook: logs, `hook-failed` deletion, persisted phase
    async fn on_failure(
        &self,
        release: &mut Release,
        index: usize,
        resources: &ResourceList,
        cancel: &CancellationToken,
    ) {
        let hook = &release.hooks[index];
        if hook.has_output_log_policy(HookOutputLogPolicy::HookFailed) {
            let log = self.capture_logs(resources).await;
            if let Some(log) = &log {
                tracing::info!(hook = %hook.name, "hook output:\n{}", log);
            }
            release.hooks[index].last_run.log = log;
        }

        if release.hooks[index].has_delete_policy(HookDeletePolicy::HookFailed) {
            // Best effort; the hook failure is what gets reported
            let budget = self.reconciler.config().hook_delete_timeout;
            if let Err(e) = self.delete_resources(resources, budget, cancel).await {
                tracing::warn!(hook = %release.hooks[index].name, error = %e, "failed to delete failed hook");
            }
        }

        self.finish(release, index, HookPhase::Failed).await;
    }

    async fn finish(&self, release: &mut Release, index: usize, phase: HookPhase) {
        let last_run = &mut release.hooks[index].last_run;
        last_run.phase = phase;
        last_run.completed_at = Some(self.clock.now());
        self.persist(release).await;
    }

    /// Delete hook resources and wait until they are gone
    ///
    /// CustomResourceDefinitions are never deleted by hook policy.
    async fn delete_resources(
        &self,
        resources: &ResourceList,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deletable = resources.filter(|r| !r.kind_tag.never_auto_delete());
        if deletable.is_empty() {
            return Ok(());
        }

        let mut report = self
            .reconciler
            .delete(&deletable, PropagationPolicy::Background, cancel)
            .await;
        if let Some(err) = report.take_error() {
            return Err(err);
        }
        self.reconciler
            .wait_for_delete(&deletable, timeout, cancel)
            .await
    }

    async fn capture_logs(&self, resources: &ResourceList) -> Option<String> {
        let mut out = String::new();
        for info in resources.iter().filter(|r| r.kind_tag.has_logs()) {
            match self.cluster.logs(info).await {
                Ok(log) => out.push_str(&log),
                Err(e) => tracing::warn!(resource = %info, error = %e, "failed to capture hook logs"),
            }
        }
        (!out.is_empty()).then_some(out)
    }

    /// Persist hook progress; the cluster is the source of truth
    async fn persist(&self, release: &Release) {
        if let Err(e) = self.storage.update(release).await {
            tracing::warn!(
                release = %release.name,
                revision = release.version,
                error = %e,
                "failed to persist hook progress"
            );
        }
    }

    fn failure(&self, release: &Release, index: usize, event: HookEvent, err: KubeError) -> KubeError {
        if err.is_cancelled() {
            return err;
        }
        let hook = &release.hooks[index];
        tracing::warn!(hook = %hook.name, %event, error = %err, "hook failed");
        KubeError::HookFailed {
            hook_name: hook.name.clone(),
            event: event.to_string(),
            source: Box::new(err),
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
