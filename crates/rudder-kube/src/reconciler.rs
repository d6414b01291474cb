//! Resource Reconciler
//!
//! Applies a target `ResourceList` against the cluster relative to the
//! current one, and waits for readiness or absence.
//!
//! Handles are processed in consecutive same-kind batches: resources of one
//! kind are written concurrently, and the next kind starts only once the
//! batch has drained, so manifest install order is preserved.
//!
//! Every cluster call and every retry backoff is raced against the
//! caller's `CancellationToken`; a cancelled call reports `Cancelled`.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use kube::api::{DynamicObject, PropagationPolicy};
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterClient;
use crate::config::EngineConfig;
use crate::error::{KubeError, Result};
use crate::kinds::{KindTag, Readiness};
use crate::patch;
use crate::resource::{ResourceInfo, ResourceList};

/// Options for `Reconciler::update`
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Replace objects instead of patching them
    pub force: bool,
    /// Propagation for deletions of removed resources
    pub propagation: PropagationPolicy,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            force: false,
            propagation: PropagationPolicy::Background,
        }
    }
}

impl UpdateOptions {
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// What a reconcile call did, plus the errors it collected
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub created: ResourceList,
    pub updated: ResourceList,
    /// Existing resources whose patch was empty
    pub unchanged: ResourceList,
    pub deleted: ResourceList,
    /// Removed from the manifest but kept by resource policy
    pub kept: ResourceList,
    pub errors: Vec<KubeError>,
}

impl ReconcileReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record a failure; cancellation is recorded once
    fn push_error(&mut self, err: KubeError) {
        if err.is_cancelled() && self.errors.iter().any(KubeError::is_cancelled) {
            return;
        }
        self.errors.push(err);
    }

    /// Join and take the collected errors
    pub fn take_error(&mut self) -> Option<KubeError> {
        KubeError::join(std::mem::take(&mut self.errors))
    }
}

enum Outcome {
    Created,
    Updated,
    Unchanged,
}

enum Deletion {
    Deleted,
    Absent,
    Kept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Until {
    Ready,
    Complete,
    Absent,
}

/// Create, patch, delete and wait on resource lists
#[derive(Clone)]
pub struct Reconciler {
    cluster: Arc<dyn ClusterClient>,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: EngineConfig) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create every resource
    ///
    /// The first batch with a failure stops the remaining batches; what
    /// was already created stays in place and is reported.
    pub async fn create(&self, list: &ResourceList, cancel: &CancellationToken) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for batch in list.by_kind_batches() {
            let results = join_all(batch.iter().map(|info| self.create_one(info, cancel))).await;
            for result in results {
                match result {
                    Ok(created) => report.created.push(created),
                    Err(e) => report.push_error(e),
                }
            }
            if !report.is_ok() {
                break;
            }
        }
        report
    }

    /// Bring the cluster from `current` to `target`
    ///
    /// Missing resources are created, existing ones patched with a
    /// three-way patch against the live object, and resources only in
    /// `current` deleted unless their resource policy keeps them. Errors
    /// are collected per resource.
    pub async fn update(
        &self,
        current: &ResourceList,
        target: &ResourceList,
        options: &UpdateOptions,
        cancel: &CancellationToken,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for batch in target.by_kind_batches() {
            if cancel.is_cancelled() {
                report.push_error(KubeError::Cancelled);
                return report;
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|info| self.update_one(current.get(&info.key()), info, options, cancel)),
            )
            .await;
            for result in results {
                match result {
                    Ok((Outcome::Created, handle)) => report.created.push(handle),
                    Ok((Outcome::Updated, handle)) => report.updated.push(handle),
                    Ok((Outcome::Unchanged, handle)) => report.unchanged.push(handle),
                    Err(e) => report.push_error(e),
                }
            }
        }

        let removed = current.difference(target).reversed();
        self.remove(&removed, &options.propagation, true, &mut report, cancel)
            .await;
        report
    }

    /// Delete every resource; absent ones count as deleted
    pub async fn delete(
        &self,
        list: &ResourceList,
        propagation: PropagationPolicy,
        cancel: &CancellationToken,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.remove(list, &propagation, false, &mut report, cancel)
            .await;
        report
    }

    /// Like `delete`, but resources whose manifest or live object carries
    /// the keep resource policy are skipped and reported as kept
    pub async fn delete_unless_kept(
        &self,
        list: &ResourceList,
        propagation: PropagationPolicy,
        cancel: &CancellationToken,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.remove(list, &propagation, true, &mut report, cancel)
            .await;
        report
    }

    /// Wait until every resource is ready
    ///
    /// Jobs are only waited on with `wait_for_jobs`.
    pub async fn wait(
        &self,
        list: &ResourceList,
        timeout: Duration,
        wait_for_jobs: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let targets = list
            .iter()
            .filter(|info| wait_for_jobs || info.kind_tag != KindTag::Job)
            .collect();
        self.poll(targets, Until::Ready, timeout, cancel).await
    }

    /// Wait until hook resources ran to completion
    pub async fn wait_for_completion(
        &self,
        list: &ResourceList,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.poll(list.iter().collect(), Until::Complete, timeout, cancel)
            .await
    }

    /// Wait until every resource is gone
    pub async fn wait_for_delete(
        &self,
        list: &ResourceList,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.poll(list.iter().collect(), Until::Absent, timeout, cancel)
            .await
    }

    /// Retry `op` on write conflicts with bounded exponential backoff
    async fn retry_conflicts<T, F, Fut>(
        &self,
        resource: &ResourceInfo,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match cancellable(cancel, op()).await {
                Err(e) if e.is_write_conflict() && attempt + 1 < retry.attempts => {
                    let delay = retry.delay(attempt);
                    tracing::debug!(
                        resource = %resource,
                        attempt = attempt + 1,
                        ?delay,
                        "write conflict, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(KubeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn create_one(&self, info: &ResourceInfo, cancel: &CancellationToken) -> Result<ResourceInfo> {
        let live = self
            .retry_conflicts(info, cancel, || self.cluster.create(info))
            .await?;
        tracing::debug!(resource = %info, kind = %info.gvk.kind, "created");

        let mut created = info.clone();
        created.refresh(live);
        Ok(created)
    }

    async fn update_one(
        &self,
        original: Option<&ResourceInfo>,
        target: &ResourceInfo,
        options: &UpdateOptions,
        cancel: &CancellationToken,
    ) -> Result<(Outcome, ResourceInfo)> {
        let Some(live) = cancellable(cancel, self.cluster.get(target)).await? else {
            let created = self.create_one(target, cancel).await?;
            return Ok((Outcome::Created, created));
        };

        let mut handle = target.clone();
        if options.force {
            let replaced = self.force_replace(target, &live, options, cancel).await?;
            handle.refresh(replaced);
            return Ok((Outcome::Updated, handle));
        }

        let modified = target.to_value()?;
        // Resources new to this release have no last-applied state
        let original = match original {
            Some(o) => o.to_value()?,
            None => modified.clone(),
        };
        let live_value = serde_json::to_value(&live)?;
        let computed = patch::three_way(
            target.strategy,
            &original,
            &modified,
            &live_value,
            &target.to_string(),
        )?;

        if computed.is_empty() {
            tracing::debug!(resource = %target, "no changes, patch skipped");
            handle.refresh(live);
            return Ok((Outcome::Unchanged, handle));
        }

        tracing::debug!(resource = %target, strategy = %computed.strategy, "patching");
        let patched = self
            .retry_conflicts(target, cancel, || self.cluster.patch(target, &computed))
            .await?;
        handle.refresh(patched);
        Ok((Outcome::Updated, handle))
    }

    /// Replace; on an invalid/immutable-field rejection delete and recreate
    async fn force_replace(
        &self,
        target: &ResourceInfo,
        live: &DynamicObject,
        options: &UpdateOptions,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject> {
        let mut replacement = target.clone();
        replacement.object.metadata.resource_version = live.metadata.resource_version.clone();

        match cancellable(cancel, self.cluster.replace(&replacement)).await {
            Ok(obj) => {
                tracing::debug!(resource = %target, "replaced");
                Ok(obj)
            }
            Err(e) if e.is_invalid() => {
                tracing::warn!(resource = %target, error = %e, "replace rejected, recreating");
                let deleted = self.cluster.delete(target, options.propagation.clone());
                match cancellable(cancel, deleted).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                self.poll(vec![target], Until::Absent, self.config.timeout, cancel)
                    .await?;
                Ok(self.create_one(target, cancel).await?.object)
            }
            Err(e) => Err(e),
        }
    }

    async fn remove(
        &self,
        list: &ResourceList,
        propagation: &PropagationPolicy,
        honor_keep: bool,
        report: &mut ReconcileReport,
        cancel: &CancellationToken,
    ) {
        for batch in list.by_kind_batches() {
            if cancel.is_cancelled() {
                report.push_error(KubeError::Cancelled);
                return;
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|info| self.delete_one(info, propagation, honor_keep, cancel)),
            )
            .await;
            for (info, result) in batch.iter().zip(results) {
                match result {
                    Ok(Deletion::Deleted | Deletion::Absent) => report.deleted.push(info.clone()),
                    Ok(Deletion::Kept) => report.kept.push(info.clone()),
                    Err(e) => report.push_error(e),
                }
            }
        }
    }

    async fn delete_one(
        &self,
        info: &ResourceInfo,
        propagation: &PropagationPolicy,
        honor_keep: bool,
        cancel: &CancellationToken,
    ) -> Result<Deletion> {
        let Some(live) = cancellable(cancel, self.cluster.get(info)).await? else {
            tracing::debug!(resource = %info, "already absent");
            return Ok(Deletion::Absent);
        };

        if honor_keep {
            let live_keeps = live
                .metadata
                .annotations
                .as_ref()
                .is_some_and(crate::annotations::has_keep_policy);
            if info.has_keep_policy() || live_keeps {
                tracing::warn!(resource = %info, "kept by resource policy");
                return Ok(Deletion::Kept);
            }
        }

        match self
            .retry_conflicts(info, cancel, || self.cluster.delete(info, propagation.clone()))
            .await
        {
            Ok(()) => {
                tracing::debug!(resource = %info, "deleted");
                Ok(Deletion::Deleted)
            }
            Err(e) if e.is_not_found() => Ok(Deletion::Absent),
            Err(e) => Err(e),
        }
    }

    /// Poll until every target satisfies `until`, bounded by `timeout`
    async fn poll(
        &self,
        targets: Vec<&ResourceInfo>,
        until: Until,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let outstanding = Mutex::new(targets.iter().map(|t| t.to_string()).collect::<Vec<_>>());

        let probe = async {
            let mut pending = targets;
            loop {
                let mut still = Vec::new();
                for info in pending {
                    if !self.check(info, until).await? {
                        still.push(info);
                    }
                }
                if still.is_empty() {
                    return Ok(());
                }
                *outstanding.lock().unwrap_or_else(PoisonError::into_inner) =
                    still.iter().map(|i| i.to_string()).collect();
                pending = still;
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(KubeError::Cancelled),
            outcome = tokio::time::timeout(timeout, probe) => match outcome {
                Ok(result) => result,
                Err(_) => Err(KubeError::WaitTimeout {
                    timeout: format!("{:?}", timeout),
                    pending: outstanding.lock().unwrap_or_else(PoisonError::into_inner).clone(),
                }),
            },
        };
        result
    }

    /// One probe of one resource; transient errors count as not yet
    async fn check(&self, info: &ResourceInfo, until: Until) -> Result<bool> {
        let live = match self.cluster.get(info).await {
            Ok(live) => live,
            Err(e) if e.is_transient() => {
                tracing::debug!(resource = %info, error = %e, "transient error while waiting");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let obj = match (until, live) {
            (Until::Absent, live) => return Ok(live.is_none()),
            (_, None) => return Ok(false),
            (_, Some(obj)) => obj,
        };
        let value = serde_json::to_value(&obj)?;
        let state = match until {
            Until::Complete => info.kind_tag.hook_completion(&value),
            _ => info.kind_tag.readiness(&value),
        };
        match state {
            Readiness::Ready => Ok(true),
            Readiness::Pending(reason) => {
                tracing::trace!(resource = %info, %reason, "not ready");
                Ok(false)
            }
            Readiness::Failed(message) => Err(KubeError::ResourceFailed {
                resource: info.to_string(),
                message,
            }),
        }
    }
}

/// Race one cluster call against `cancel`
async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KubeError::Cancelled),
        result = call => result,
    }
}
