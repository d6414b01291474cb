//! Upgrade

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rudder_core::{Chart, HookEvent, Release, Status, Values};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Configuration, InstallOptions, RollbackOptions, run_detached, validate_release_name};
use crate::error::{KubeError, Result};
use crate::reconciler::UpdateOptions;
use crate::resource::ResourceList;
use crate::storage::validate_custom_labels;

/// Options for upgrade operation
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// Release name
    pub name: String,

    /// Namespace used when the upgrade falls back to an install
    pub namespace: String,

    /// Install if release doesn't exist
    pub install: bool,

    /// Merge new values over the current revision's values
    pub reuse_values: bool,

    /// Ignore the current revision's values
    pub reset_values: bool,

    /// Replace objects instead of patching them
    pub force: bool,

    /// Delete resources created by a failed attempt
    pub cleanup_on_fail: bool,

    /// Roll back to the last deployed revision when the upgrade fails
    pub rollback_on_failure: bool,

    /// Skip pre/post-upgrade hooks
    pub disable_hooks: bool,

    /// Wait for resources to be ready
    pub wait: bool,

    /// Also wait for Jobs to complete
    pub wait_for_jobs: bool,

    /// Budget for hooks and waits, defaults to the engine timeout
    pub timeout: Option<Duration>,

    /// Revisions to keep, overriding the engine setting
    pub max_history: Option<usize>,

    /// Render and diff only
    pub dry_run: bool,

    /// Description for this revision
    pub description: Option<String>,

    /// Custom labels to add
    pub labels: BTreeMap<String, String>,
}

impl UpgradeOptions {
    /// Create default upgrade options
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Enable install-if-not-exists
    pub fn with_install(mut self) -> Self {
        self.install = true;
        self
    }

    /// Wait, and roll back on failure
    pub fn with_atomic(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.rollback_on_failure = true;
        self.timeout = Some(timeout);
        self
    }

    pub fn with_rollback_on_failure(mut self) -> Self {
        self.rollback_on_failure = true;
        self
    }

    pub fn with_cleanup_on_fail(mut self) -> Self {
        self.cleanup_on_fail = true;
        self
    }

    /// Enable force mode
    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = Some(timeout);
        self
    }

    pub fn with_reuse_values(mut self) -> Self {
        self.reuse_values = true;
        self
    }

    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = Some(max);
        self
    }

    fn as_install(&self, replace: bool) -> InstallOptions {
        InstallOptions {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            dry_run: self.dry_run,
            disable_hooks: self.disable_hooks,
            wait: self.wait,
            wait_for_jobs: self.wait_for_jobs,
            timeout: self.timeout,
            replace,
            atomic: self.rollback_on_failure,
            description: self.description.clone(),
            labels: self.labels.clone(),
        }
    }
}

impl Configuration {
    /// Upgrade a release to `chart`
    ///
    /// The cluster-mutating phase runs on its own task. If `cancel` fires
    /// first this waits for that task to record its outcome and then
    /// returns `Cancelled`.
    pub async fn upgrade(
        &self,
        chart: &Chart,
        values: Values,
        options: &UpgradeOptions,
        cancel: &CancellationToken,
    ) -> Result<Release> {
        validate_release_name(&options.name)?;
        validate_custom_labels(&options.labels)?;
        chart.validate()?;

        let last = match self.storage.last(&options.name).await {
            Ok(last) => last,
            Err(KubeError::ReleaseNotFound { .. }) if options.install => {
                tracing::info!(release = %options.name, "release not found, installing");
                return self
                    .install(chart, values, &options.as_install(false), cancel)
                    .await;
            }
            Err(e) => return Err(e),
        };
        self.ensure_not_pending(&last)?;
        if last.status() == Status::Uninstalled {
            if options.install {
                return self
                    .install(chart, values, &options.as_install(true), cancel)
                    .await;
            }
            return Err(KubeError::AlreadyUninstalled {
                name: options.name.clone(),
            });
        }

        // Without a deployed revision the last attempt is the baseline
        let current = match self.storage.deployed(&options.name).await {
            Ok(current) => current,
            Err(KubeError::ReleaseNotFound { .. }) => last.clone(),
            Err(e) => return Err(e),
        };

        let values = Values::for_upgrade(
            &current.config,
            &values,
            options.reuse_values,
            options.reset_values,
        );
        let rendered = self.render(chart, &values)?;
        let mut release = Release::new(
            &last.name,
            &last.namespace,
            last.version + 1,
            chart.clone(),
            values,
            Status::PendingUpgrade,
            self.now(),
        );
        release.info.first_deployed = current.info.first_deployed;
        release.info.description = "Preparing upgrade".to_string();
        release.info.notes = rendered.notes;
        release.manifest = rendered.manifest;
        release.hooks = rendered.hooks;
        release.labels = options.labels.clone();

        let current_list = self.build(&current, false)?;
        let target = self.build(&release, true)?;
        self.check_ownership(&release, &target.difference(&current_list))
            .await?;

        if options.dry_run {
            release.info.description = "Dry run complete".to_string();
            return Ok(release);
        }

        self.storage.create(&release).await?;
        tracing::info!(
            release = %release.name,
            revision = release.version,
            from = current.version,
            "upgrading release"
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
                    .perform_upgrade(&mut release, &current_list, &target, &options, &mut created, &token)
                    .await;
                match outcome {
                    Ok(()) => this.finalize_upgrade(&mut release, &options).await,
                    Err(err) => this.fail_release(&mut release, err, &created, &options).await,
                }
            }
        };

        let outcome = run_detached(task, cancel).await;
        let release = shared.lock().await.clone();
        outcome.map(|()| release)
    }

    async fn perform_upgrade(
        &self,
        release: &mut Release,
        current: &ResourceList,
        target: &ResourceList,
        options: &UpgradeOptions,
        created: &mut ResourceList,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let hooks = self.hook_executor();
        let reconciler = self.reconciler();

        if !options.disable_hooks {
            hooks
                .execute(release, HookEvent::PreUpgrade, timeout, cancel)
                .await?;
        }

        let update = UpdateOptions::default().with_force(options.force);
        let mut report = reconciler.update(current, target, &update, cancel).await;
        created.extend(std::mem::take(&mut report.created));
        if !report.kept.is_empty() {
            tracing::info!(
                release = %release.name,
                kept = ?report.kept.names(),
                "resources kept by resource policy"
            );
        }
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
                .execute(release, HookEvent::PostUpgrade, timeout, cancel)
                .await?;
        }
        Ok(())
    }

    async fn finalize_upgrade(&self, release: &mut Release, options: &UpgradeOptions) -> Result<()> {
        self.supersede_deployed(release).await;
        let description = options
            .description
            .clone()
            .unwrap_or_else(|| "Upgrade complete".to_string());
        release.transition(Status::Deployed, description, self.now())?;
        self.persist(release).await;
        self.prune_history(&release.name, options.max_history).await;
        tracing::info!(release = %release.name, revision = release.version, "release upgraded");
        Ok(())
    }

    /// Record a failed upgrade, then compensate as configured
    ///
    /// Always returns the failure; a successful rollback only changes
    /// what is stored.
    async fn fail_release(
        &self,
        release: &mut Release,
        err: KubeError,
        created: &ResourceList,
        options: &UpgradeOptions,
    ) -> Result<()> {
        tracing::warn!(
            release = %release.name,
            revision = release.version,
            error = %err,
            "upgrade failed"
        );
        let description = format!("Upgrade \"{}\" failed: {}", release.name, err);
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

        if !options.rollback_on_failure {
            return Err(err.in_release(&release.name, "upgrade"));
        }

        // Only ever roll back to a revision that was once deployed
        let baseline = match self.storage.history(&release.name).await {
            Ok(history) => history
                .into_iter()
                .rev()
                .find(|r| r.version != release.version && r.status().is_baseline()),
            Err(e) => return Err(KubeError::Joined(vec![err, e]).in_release(&release.name, "upgrade")),
        };
        let Some(baseline) = baseline else {
            tracing::warn!(release = %release.name, "no deployed revision to roll back to");
            return Err(err.in_release(&release.name, "upgrade"));
        };

        tracing::info!(
            release = %release.name,
            revision = baseline.version,
            "rolling back failed upgrade"
        );
        let rollback = RollbackOptions {
            name: release.name.clone(),
            version: baseline.version,
            force: options.force,
            wait: options.wait,
            wait_for_jobs: options.wait_for_jobs,
            cleanup_on_fail: options.cleanup_on_fail,
            disable_hooks: options.disable_hooks,
            timeout: options.timeout,
            max_history: options.max_history,
            ..Default::default()
        };
        // Fresh scope: compensation still runs after the caller cancelled
        match self.rollback(&rollback, &CancellationToken::new()).await {
            Ok(restored) => {
                tracing::info!(
                    release = %release.name,
                    revision = restored.version,
                    "rolled back after failed upgrade"
                );
                Err(err.in_release(&release.name, "upgrade"))
            }
            Err(rollback_err) => {
                Err(KubeError::Joined(vec![err, rollback_err]).in_release(&release.name, "upgrade"))
            }
        }
    }
}
