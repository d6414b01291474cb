//! Rollback

use std::sync::Arc;
use std::time::Duration;

use rudder_core::{HookEvent, HookExecution, Release, Status};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Configuration, run_detached, validate_release_name};
use crate::error::{KubeError, Result};
use crate::reconciler::UpdateOptions;
use crate::resource::ResourceList;

/// Options for rollback operation
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// Release name
    pub name: String,

    /// Revision to restore; 0 means the one before the latest
    pub version: u32,

    /// Replace objects instead of patching them
    pub force: bool,

    /// Wait for resources to be ready
    pub wait: bool,

    /// Also wait for Jobs to complete
    pub wait_for_jobs: bool,

    /// Delete resources created by a failed attempt
    pub cleanup_on_fail: bool,

    /// Skip pre/post-rollback hooks
    pub disable_hooks: bool,

    /// Budget for hooks and waits, defaults to the engine timeout
    pub timeout: Option<Duration>,

    /// Revisions to keep, overriding the engine setting
    pub max_history: Option<usize>,

    /// Resolve the target only
    pub dry_run: bool,

    /// Description for the new revision
    pub description: Option<String>,
}

impl RollbackOptions {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            ..Default::default()
        }
    }

    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cleanup_on_fail(mut self) -> Self {
        self.cleanup_on_fail = true;
        self
    }

    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

impl Configuration {
    /// Restore an earlier revision as a new revision
    pub async fn rollback(
        &self,
        options: &RollbackOptions,
        cancel: &CancellationToken,
    ) -> Result<Release> {
        validate_release_name(&options.name)?;

        let current = self.storage.last(&options.name).await?;
        self.ensure_not_pending(&current)?;

        let version = match options.version {
            0 => current.version.saturating_sub(1),
            v => v,
        };
        let not_possible = |reason: String| KubeError::RollbackNotPossible {
            name: options.name.clone(),
            reason,
        };
        if version == 0 {
            return Err(not_possible("no previous revision".to_string()));
        }
        let target = match self.storage.get(&options.name, version).await {
            Ok(target) => target,
            Err(KubeError::ReleaseNotFound { .. }) => {
                return Err(not_possible(format!("revision {} not found", version)));
            }
            Err(e) => return Err(e),
        };

        let mut release = Release::new(
            &current.name,
            &current.namespace,
            current.version + 1,
            target.chart.clone(),
            target.config.clone(),
            Status::PendingRollback,
            self.now(),
        );
        release.info.first_deployed = current.info.first_deployed;
        release.info.notes = target.info.notes.clone();
        release.info.description = format!("Rollback to {}", version);
        release.manifest = target.manifest.clone();
        release.hooks = target
            .hooks
            .iter()
            .cloned()
            .map(|mut hook| {
                hook.last_run = HookExecution::default();
                hook
            })
            .collect();
        release.labels = target.labels.clone();

        let current_list = self.build(&current, false)?;
        let target_list = self.build(&release, true)?;
        self.check_ownership(&release, &target_list.difference(&current_list))
            .await?;

        if options.dry_run {
            release.info.description = "Dry run complete".to_string();
            return Ok(release);
        }

        self.storage.create(&release).await?;
        tracing::info!(
            release = %release.name,
            revision = release.version,
            target = version,
            "rolling back release"
        );

        let shared = Arc::new(Mutex::new(release));
        let task = {
            let this = self.clone();
            let shared = shared.clone();
            let options = options.clone();
            let token = cancel.child_token();
            async move {
                let mut release = shared.lock().await;
                let mut created = ResourceList::new();
                let outcome = this
                    .perform_rollback(&mut release, &current_list, &target_list, &options, &mut created, &token)
                    .await;
                match outcome {
                    Ok(()) => this.finalize_rollback(&mut release, &options).await,
                    Err(err) => this.fail_rollback(&mut release, err, &created, &options).await,
                }
            }
        };

        let outcome = run_detached(task, cancel).await;
        let release = shared.lock().await.clone();
        outcome.map(|()| release)
    }

    async fn perform_rollback(
        &self,
        release: &mut Release,
        current: &ResourceList,
        target: &ResourceList,
        options: &RollbackOptions,
        created: &mut ResourceList,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let hooks = self.hook_executor();
        let reconciler = self.reconciler();

        if !options.disable_hooks {
            hooks
                .execute(release, HookEvent::PreRollback, timeout, cancel)
                .await?;
        }

        let update = UpdateOptions::default().with_force(options.force);
        let mut report = reconciler.update(current, target, &update, cancel).await;
        created.extend(std::mem::take(&mut report.created));
        if let Some(err) = report.take_error() {
            return Err(err);
        }

        if options.wait {
            reconciler
                .wait(target, timeout, options.wait_for_jobs, cancel)
                .await?;
        }

        if !options.disable_hooks {
            hooks
                .execute(release, HookEvent::PostRollback, timeout, cancel)
                .await?;
        }
        Ok(())
    }

    async fn finalize_rollback(&self, release: &mut Release, options: &RollbackOptions) -> Result<()> {
        self.supersede_deployed(release).await;
        let description = options
            .description
            .clone()
            .unwrap_or_else(|| release.info.description.clone());
        release.transition(Status::Deployed, description, self.now())?;
        self.persist(release).await;
        self.prune_history(&release.name, options.max_history).await;
        tracing::info!(release = %release.name, revision = release.version, "rollback complete");
        Ok(())
    }

    async fn fail_rollback(
        &self,
        release: &mut Release,
        err: KubeError,
        created: &ResourceList,
        options: &RollbackOptions,
    ) -> Result<()> {
        tracing::warn!(
            release = %release.name,
            revision = release.version,
            error = %err,
            "rollback failed"
        );
        let description = format!("Rollback \"{}\" failed: {}", release.name, err);
        if let Err(e) = release.transition(Status::Failed, description, self.now()) {
            tracing::warn!(release = %release.name, error = %e, "cannot mark release failed");
        }
        self.persist(release).await;

        let mut err = err;
        if options.cleanup_on_fail
            && let Some(cleanup) = self.cleanup_created(created).await
        {
            err = KubeError::Joined(vec![err, cleanup]);
        }
        Err(err.in_release(&release.name, "rollback"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testutil::{Fixture, chart};
    use crate::actions::{InstallOptions, UpgradeOptions};
    use crate::cluster::{Injection, Op};
    use rudder_core::Values;

    async fn two_revisions(f: &Fixture) {
        f.cfg
            .install(&chart("1"), Values::new(), &InstallOptions::new("r1", "default"), &f.cancel)
            .await
            .unwrap();
        f.cfg
            .upgrade(&chart("2"), Values::new(), &UpgradeOptions::new("r1", "default"), &f.cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rollback_to_previous() {
        let f = Fixture::new();
        two_revisions(&f).await;

        let release = f.cfg.rollback(&RollbackOptions::new("r1", 0), &f.cancel).await.unwrap();
        assert_eq!(release.version, 3);
        assert_eq!(release.status(), Status::Deployed);
        assert_eq!(release.info.description, "Rollback to 1");
        assert_eq!(release.chart.metadata.version.to_string(), "0.1.0");
        assert_eq!(f.cfg.storage.get("r1", 2).await.unwrap().status(), Status::Superseded);

        let cm = f.mock.object("ConfigMap", Some("default"), "hello").unwrap();
        assert_eq!(cm["data"]["version"], "1");
    }

    #[tokio::test]
    async fn test_rollback_not_possible() {
        let f = Fixture::new();
        f.cfg
            .install(&chart("1"), Values::new(), &InstallOptions::new("r1", "default"), &f.cancel)
            .await
            .unwrap();

        let err = f.cfg.rollback(&RollbackOptions::new("r1", 0), &f.cancel).await.unwrap_err();
        assert!(matches!(err, KubeError::RollbackNotPossible { .. }));

        let err = f.cfg.rollback(&RollbackOptions::new("r1", 7), &f.cancel).await.unwrap_err();
        assert!(matches!(err, KubeError::RollbackNotPossible { .. }));
    }

    #[tokio::test]
    async fn test_failed_rollback_does_not_recurse() {
        let f = Fixture::new();
        two_revisions(&f).await;
        f.mock.inject(Injection::new(Op::Patch, 500).kind("ConfigMap"));

        let err = f.cfg.rollback(&RollbackOptions::new("r1", 1), &f.cancel).await.unwrap_err();
        match &err {
            KubeError::ReleaseFailed { phase, .. } => assert_eq!(phase, "rollback"),
            other => panic!("unexpected {:?}", other),
        }

        let history = f.cfg.storage.history("r1").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].status(), Status::Failed);
        assert_eq!(history[1].status(), Status::Deployed);
    }

    #[tokio::test]
    async fn test_rollback_resets_hook_runs() {
        let f = Fixture::new();
        let hooked = chart("1").with_template(
            "templates/hook.yaml",
            "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: prepare\n  annotations:\n    rudder.io/hook: pre-install,pre-rollback\nspec:\n  template:\n    spec:\n      restartPolicy: Never\n      containers:\n        - name: p\n          image: busybox\n",
        );
        f.cfg
            .install(&hooked, Values::new(), &InstallOptions::new("r1", "default"), &f.cancel)
            .await
            .unwrap();
        f.cfg
            .upgrade(&chart("2"), Values::new(), &UpgradeOptions::new("r1", "default"), &f.cancel)
            .await
            .unwrap();

        let release = f.cfg.rollback(&RollbackOptions::new("r1", 1), &f.cancel).await.unwrap();
        assert_eq!(release.hooks.len(), 1);
        let run = &release.hooks[0].last_run;
        assert_eq!(run.phase, rudder_core::HookPhase::Succeeded);
        let installed = f.cfg.storage.get("r1", 1).await.unwrap();
        assert!(run.started_at > installed.hooks[0].last_run.started_at);
    }
}
