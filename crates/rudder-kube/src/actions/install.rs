//! Install

use std::collections::BTreeMap;
use std::time::Duration;

use rudder_core::{Chart, HookEvent, Release, Status, Values};
use tokio_util::sync::CancellationToken;

use super::{Configuration, UninstallOptions, validate_release_name};
use crate::error::{KubeError, Result};
use crate::reconciler::UpdateOptions;
use crate::resource::ResourceList;
use crate::storage::validate_custom_labels;

/// Options for install operation
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Render and validate only; nothing is stored or applied
    pub dry_run: bool,

    /// Skip pre/post-install hooks
    pub disable_hooks: bool,

    /// Wait for resources to be ready
    pub wait: bool,

    /// Also wait for Jobs to complete
    pub wait_for_jobs: bool,

    /// Budget for hooks and waits, defaults to the engine timeout
    pub timeout: Option<Duration>,

    /// Reuse the name of a failed or uninstalled release
    pub replace: bool,

    /// Uninstall the release again if the install fails
    pub atomic: bool,

    /// Description for this revision
    pub description: Option<String>,

    /// Custom labels to add to the release
    pub labels: BTreeMap<String, String>,
}

impl InstallOptions {
    /// Create default install options with name and namespace
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Enable waiting for resources
    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = Some(timeout);
        self
    }

    /// Uninstall on failure; implies waiting
    pub fn with_atomic(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.atomic = true;
        self.timeout = Some(timeout);
        self
    }

    pub fn with_replace(mut self) -> Self {
        self.replace = true;
        self
    }

    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_disable_hooks(mut self) -> Self {
        self.disable_hooks = true;
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Configuration {
    /// Install `chart` as a new release
    pub async fn install(
        &self,
        chart: &Chart,
        values: Values,
        options: &InstallOptions,
        cancel: &CancellationToken,
    ) -> Result<Release> {
        validate_release_name(&options.name)?;
        validate_custom_labels(&options.labels)?;
        chart.validate()?;

        let previous = self.available_name(options).await?;
        let version = previous.as_ref().map_or(1, |p| p.version + 1);

        let rendered = self.render(chart, &values)?;
        let mut release = Release::new(
            &options.name,
            &options.namespace,
            version,
            chart.clone(),
            values,
            Status::PendingInstall,
            self.now(),
        );
        release.manifest = rendered.manifest;
        release.hooks = rendered.hooks;
        release.info.notes = rendered.notes;
        release.info.description = "Initial install underway".to_string();
        release.labels = options.labels.clone();

        let target = self.build(&release, true)?;
        let adopted = self.check_ownership(&release, &target).await?;

        if options.dry_run {
            release.info.description = "Dry run complete".to_string();
            return Ok(release);
        }

        if options.replace
            && let Some(mut previous) = previous
        {
            let description = format!("Replaced by revision {}", release.version);
            previous.transition(Status::Superseded, description, self.now())?;
            self.storage.update(&previous).await?;
        }

        self.storage.create(&release).await?;
        tracing::info!(
            release = %release.name,
            revision = release.version,
            namespace = %release.namespace,
            "installing release"
        );

        match self
            .perform_install(&mut release, &target, &adopted, options, cancel)
            .await
        {
            Ok(()) => {
                let description = options
                    .description
                    .clone()
                    .unwrap_or_else(|| "Install complete".to_string());
                release.transition(Status::Deployed, description, self.now())?;
                self.persist(&release).await;
                self.prune_history(&release.name, None).await;
                tracing::info!(release = %release.name, revision = release.version, "release deployed");
                Ok(release)
            }
            Err(err) => self.fail_install(release, err, options).await,
        }
    }

    /// The latest revision when the name may be reused, `None` when unused
    async fn available_name(&self, options: &InstallOptions) -> Result<Option<Release>> {
        let latest = match self.storage.last(&options.name).await {
            Ok(latest) => latest,
            Err(KubeError::ReleaseNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.ensure_not_pending(&latest)?;

        let reusable = match latest.status() {
            Status::Uninstalled => true,
            Status::Failed => options.replace,
            _ => false,
        };
        if !reusable {
            return Err(KubeError::ReleaseAlreadyExists {
                key: latest.key(),
            });
        }
        Ok(Some(latest))
    }

    async fn perform_install(
        &self,
        release: &mut Release,
        target: &ResourceList,
        adopted: &ResourceList,
        options: &InstallOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let hooks = self.hook_executor();
        let reconciler = self.reconciler();

        if !options.disable_hooks {
            hooks
                .execute(release, HookEvent::PreInstall, timeout, cancel)
                .await?;
        }

        // Objects this release already owns are patched, the rest created
        let mut report = if adopted.is_empty() {
            reconciler.create(target, cancel).await
        } else {
            reconciler
                .update(adopted, target, &UpdateOptions::default(), cancel)
                .await
        };
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
                .execute(release, HookEvent::PostInstall, timeout, cancel)
                .await?;
        }
        Ok(())
    }

    async fn fail_install(
        &self,
        mut release: Release,
        err: KubeError,
        options: &InstallOptions,
    ) -> Result<Release> {
        tracing::warn!(release = %release.name, error = %err, "install failed");
        let description = format!("Release \"{}\" failed: {}", release.name, err);
        release.transition(Status::Failed, description, self.now())?;
        self.persist(&release).await;

        if options.atomic {
            tracing::info!(release = %release.name, "atomic install failed, uninstalling");
            let uninstall = UninstallOptions {
                name: options.name.clone(),
                timeout: options.timeout,
                ..Default::default()
            };
            if let Err(cleanup) = self.uninstall(&uninstall, &CancellationToken::new()).await {
                let joined = KubeError::Joined(vec![err, cleanup]);
                return Err(joined.in_release(&release.name, "install"));
            }
        }
        Err(err.in_release(&release.name, "install"))
    }
}
