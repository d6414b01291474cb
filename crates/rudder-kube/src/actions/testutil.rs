//! Shared fixtures for orchestrator tests

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use rudder_core::{Chart, ManualClock, PassthroughRenderer};
use tokio_util::sync::CancellationToken;

use super::Configuration;
use crate::cluster::MockCluster;
use crate::config::{EngineConfig, RetryConfig};
use crate::storage::{MemoryStore, Storage};

pub(crate) struct Fixture {
    pub mock: Arc<MockCluster>,
    pub store: Arc<MemoryStore>,
    pub cfg: Configuration,
    pub cancel: CancellationToken,
}

impl Fixture {
    pub fn new() -> Self {
        let mock = Arc::new(MockCluster::new());
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            retry: RetryConfig {
                attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                factor: 2,
            },
            ..EngineConfig::default()
        };
        let clock = ManualClock::new(chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let cfg = Configuration::new(
            Storage::new(store.clone(), config.manager.clone()),
            mock.clone(),
            Arc::new(PassthroughRenderer),
            Arc::new(clock),
            config,
        );
        Self {
            mock,
            store,
            cfg,
            cancel: CancellationToken::new(),
        }
    }
}

/// `hello` chart whose content changes with `version`
pub(crate) fn chart(version: &str) -> Chart {
    Chart::new("hello", &format!("0.{}.0", version))
        .unwrap()
        .with_template(
            "templates/configmap.yaml",
            format!(
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: hello\ndata:\n  version: \"{}\"\n",
                version
            ),
        )
        .with_template(
            "templates/deployment.yaml",
            format!(
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 1\n  selector:\n    matchLabels:\n      app: web\n  template:\n    metadata:\n      labels:\n        app: web\n    spec:\n      containers:\n        - name: app\n          image: nginx:{}\n",
                version
            ),
        )
        .with_template(
            "templates/service.yaml",
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\nspec:\n  ports:\n    - port: 80\n",
        )
        .with_template("templates/NOTES.txt", "thanks for installing\n")
}
