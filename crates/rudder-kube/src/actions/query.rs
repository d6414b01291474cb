//! Read-only release queries

use rudder_core::Release;

use super::{Configuration, validate_release_name};
use crate::error::Result;

impl Configuration {
    /// A specific revision, or the latest one when `version` is `None`
    pub async fn status(&self, name: &str, version: Option<u32>) -> Result<Release> {
        validate_release_name(name)?;
        match version {
            Some(version) => self.storage.get(name, version).await,
            None => self.storage.last(name).await,
        }
    }

    /// Revisions of a release, newest first, at most `max` of them
    pub async fn history(&self, name: &str, max: Option<usize>) -> Result<Vec<Release>> {
        validate_release_name(name)?;
        let mut history = self.storage.history(name).await?;
        history.reverse();
        if let Some(max) = max {
            history.truncate(max);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use crate::actions::testutil::{Fixture, chart};
    use crate::actions::{InstallOptions, UpgradeOptions};
    use crate::error::KubeError;
    use rudder_core::{Status, Values};

    #[tokio::test]
    async fn test_status_and_history() {
        let f = Fixture::new();
        f.cfg
            .install(&chart("1"), Values::new(), &InstallOptions::new("r1", "default"), &f.cancel)
            .await
            .unwrap();
        f.cfg
            .upgrade(&chart("2"), Values::new(), &UpgradeOptions::new("r1", "default"), &f.cancel)
            .await
            .unwrap();

        assert_eq!(f.cfg.status("r1", None).await.unwrap().version, 2);
        assert_eq!(f.cfg.status("r1", Some(1)).await.unwrap().status(), Status::Superseded);

        let history = f.cfg.history("r1", None).await.unwrap();
        let versions: Vec<u32> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![2, 1]);
        assert_eq!(f.cfg.history("r1", Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_unknown_release() {
        let f = Fixture::new();
        let err = f.cfg.status("missing", None).await.unwrap_err();
        assert!(matches!(err, KubeError::ReleaseNotFound { .. }));
    }
}
