//! Release tests

use std::time::Duration;

use rudder_core::{Hook, HookEvent, Release, Status};
use tokio_util::sync::CancellationToken;

use super::{Configuration, validate_release_name};
use crate::error::{KubeError, Result};

/// Options for running a release's test hooks
#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    /// Release name
    pub name: String,

    /// Hook names to run; a leading `!` excludes a name instead
    pub filters: Vec<String>,

    /// Budget for all tests, defaults to the engine timeout
    pub timeout: Option<Duration>,
}

impl TestOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn selects(&self, hook: &Hook) -> bool {
        let (excluded, included): (Vec<&str>, Vec<&str>) = self
            .filters
            .iter()
            .map(String::as_str)
            .partition(|f| f.starts_with('!'));
        if excluded.iter().any(|f| f[1..] == hook.name) {
            return false;
        }
        included.is_empty() || included.contains(&hook.name.as_str())
    }
}

impl Configuration {
    /// Run the `test` hooks of the latest revision
    ///
    /// Results are recorded on the revision's hooks whether or not a test
    /// fails.
    pub async fn test_release(
        &self,
        options: &TestOptions,
        cancel: &CancellationToken,
    ) -> Result<Release> {
        validate_release_name(&options.name)?;
        let mut release = self.storage.last(&options.name).await?;
        self.ensure_not_pending(&release)?;
        if release.status() == Status::Uninstalled {
            return Err(KubeError::AlreadyUninstalled {
                name: options.name.clone(),
            });
        }

        let timeout = options.timeout.unwrap_or(self.config.timeout);
        tracing::info!(release = %release.name, revision = release.version, "running release tests");
        let outcome = self
            .hook_executor()
            .execute_filtered(&mut release, HookEvent::Test, timeout, cancel, |hook| {
                options.selects(hook)
            })
            .await;
        self.persist(&release).await;

        match outcome {
            Ok(()) => Ok(release),
            Err(e) => Err(e.in_release(&release.name, "test")),
        }
    }
}
