//! Uninstall

use std::time::Duration;

use kube::api::PropagationPolicy;
use rudder_core::{HookEvent, Release, Status};
use tokio_util::sync::CancellationToken;

use super::{Configuration, validate_release_name};
use crate::error::{KubeError, Result};

/// Options for uninstall operation
#[derive(Debug, Clone, Default)]
pub struct UninstallOptions {
    /// Release name
    pub name: String,

    /// Keep the revision history, marked uninstalled
    pub keep_history: bool,

    /// Skip pre/post-delete hooks
    pub disable_hooks: bool,

    /// Wait until deleted resources are gone
    pub wait: bool,

    /// Budget for hooks and waits, defaults to the engine timeout
    pub timeout: Option<Duration>,

    /// Report what would be removed
    pub dry_run: bool,

    /// Description for the final revision
    pub description: Option<String>,
}

impl UninstallOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_keep_history(mut self) -> Self {
        self.keep_history = true;
        self
    }

    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = Some(timeout);
        self
    }

    pub fn with_disable_hooks(mut self) -> Self {
        self.disable_hooks = true;
        self
    }

    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Result of an uninstall
#[derive(Debug, Clone)]
pub struct UninstallResponse {
    /// Final state of the latest revision
    pub release: Release,

    /// Resources left in place by the keep resource policy
    pub kept: Vec<String>,

    /// Human readable note about kept resources, empty when none
    pub info: String,
}

impl Configuration {
    /// Remove a release's resources and, unless kept, its history
    ///
    /// A pending release may be uninstalled; this is how a release stuck
    /// after a crash is cleared.
    pub async fn uninstall(
        &self,
        options: &UninstallOptions,
        cancel: &CancellationToken,
    ) -> Result<UninstallResponse> {
        validate_release_name(&options.name)?;

        let history = self.storage.history(&options.name).await?;
        let Some(mut release) = history.last().cloned() else {
            return Err(KubeError::ReleaseNotFound {
                name: options.name.clone(),
            });
        };

        if options.dry_run {
            return Ok(UninstallResponse {
                release,
                kept: Vec::new(),
                info: String::new(),
            });
        }

        if release.status() == Status::Uninstalled {
            if options.keep_history {
                return Err(KubeError::AlreadyUninstalled {
                    name: options.name.clone(),
                });
            }
            tracing::info!(release = %options.name, "purging history of uninstalled release");
            self.storage.purge(&options.name).await?;
            return Ok(UninstallResponse {
                release,
                kept: Vec::new(),
                info: String::new(),
            });
        }

        release.transition(
            Status::Uninstalling,
            "Deletion in progress (or silently failed)",
            self.now(),
        )?;
        self.storage.update(&release).await?;
        tracing::info!(release = %release.name, revision = release.version, "uninstalling release");

        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let hooks = self.hook_executor();
        let reconciler = self.reconciler();

        if !options.disable_hooks {
            hooks
                .execute(&mut release, HookEvent::PreDelete, timeout, cancel)
                .await
                .map_err(|e| e.in_release(&options.name, "uninstall"))?;
        }

        let mut errors = Vec::new();
        let resources = match self.build(&release, false) {
            Ok(resources) => resources,
            Err(e) => {
                errors.push(e);
                Default::default()
            }
        };
        let mut report = reconciler
            .delete_unless_kept(&resources.reversed(), PropagationPolicy::Background, cancel)
            .await;
        errors.extend(report.take_error());
        let kept = report.kept.names();

        if options.wait
            && let Err(e) = reconciler.wait_for_delete(&report.deleted, timeout, cancel).await
        {
            errors.push(e);
        }

        if !options.disable_hooks
            && let Err(e) = hooks
                .execute(&mut release, HookEvent::PostDelete, timeout, cancel)
                .await
        {
            errors.push(e);
        }

        let description = options
            .description
            .clone()
            .unwrap_or_else(|| "Uninstallation complete".to_string());
        release.transition(Status::Uninstalled, description, self.now())?;

        if options.keep_history {
            self.persist(&release).await;
        } else if let Err(e) = self.storage.purge(&release.name).await {
            tracing::warn!(release = %release.name, error = %e, "failed to purge release history");
        }

        let info = if kept.is_empty() {
            String::new()
        } else {
            format!(
                "These resources were kept due to the resource policy:\n{}",
                kept.iter().map(|k| format!("[{}]", k)).collect::<Vec<_>>().join("\n")
            )
        };

        if let Some(err) = KubeError::join(errors) {
            return Err(err.in_release(&release.name, "uninstall"));
        }
        tracing::info!(release = %release.name, kept = kept.len(), "release uninstalled");
        Ok(UninstallResponse {
            release,
            kept,
            info,
        })
    }
}
