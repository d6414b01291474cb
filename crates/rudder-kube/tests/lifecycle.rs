//! Release lifecycle tests against the in-memory cluster

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use rudder_core::{Chart, ManualClock, PassthroughRenderer, Status, Values};
use rudder_kube::cluster::{Injection, Op};
use rudder_kube::{
    Configuration, EngineConfig, InstallOptions, KubeError, MemoryStore, MockCluster, RetryConfig,
    UninstallOptions, UpgradeOptions,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct Env {
    mock: Arc<MockCluster>,
    cfg: Configuration,
    cancel: CancellationToken,
}

fn env() -> Env {
    env_with_retry(RetryConfig {
        attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        factor: 2,
    })
}

fn env_with_retry(retry: RetryConfig) -> Env {
    let mock = Arc::new(MockCluster::new());
    let config = EngineConfig {
        timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        retry,
        ..EngineConfig::default()
    };
    let clock = ManualClock::new(chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    let cfg = Configuration::new(
        rudder_kube::Storage::new(Arc::new(MemoryStore::new()), config.manager.clone()),
        mock.clone(),
        Arc::new(PassthroughRenderer),
        Arc::new(clock),
        config,
    );
    Env {
        mock,
        cfg,
        cancel: CancellationToken::new(),
    }
}

fn hello(version: &str) -> Chart {
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
}

fn job_hook(name: &str, event: &str, weight: i32) -> String {
    format!(
        "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: {}\n  annotations:\n    rudder.io/hook: {}\n    rudder.io/hook-weight: \"{}\"\nspec:\n  template:\n    spec:\n      restartPolicy: Never\n      containers:\n        - name: h\n          image: busybox\n",
        name, event, weight
    )
}

async fn install(env: &Env, chart: &Chart) -> rudder_core::Release {
    env.cfg
        .install(chart, Values::new(), &InstallOptions::new("r1", "default"), &env.cancel)
        .await
        .unwrap()
}

async fn statuses(env: &Env) -> Vec<(u32, Status)> {
    env.cfg
        .storage
        .history("r1")
        .await
        .unwrap()
        .iter()
        .map(|r| (r.version, r.status()))
        .collect()
}

mod upgrade_lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_failed_upgrade_rolls_back() {
        let env = env();
        let first = install(&env, &hello("1")).await;
        assert_eq!((first.version, first.status()), (1, Status::Deployed));

        let second = env
            .cfg
            .upgrade(&hello("2"), Values::new(), &UpgradeOptions::new("r1", "default"), &env.cancel)
            .await
            .unwrap();
        assert_eq!((second.version, second.status()), (2, Status::Deployed));
        assert_eq!(statuses(&env).await, vec![(1, Status::Superseded), (2, Status::Deployed)]);

        env.mock
            .inject(Injection::new(Op::Patch, 500).kind("ConfigMap").times(1));
        let options = UpgradeOptions::new("r1", "default").with_rollback_on_failure();
        let err = env
            .cfg
            .upgrade(&hello("3"), Values::new(), &options, &env.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::ReleaseFailed { .. }));
        assert!(err.to_string().contains("r1"));

        assert_eq!(
            statuses(&env).await,
            vec![
                (1, Status::Superseded),
                (2, Status::Superseded),
                (3, Status::Failed),
                (4, Status::Deployed),
            ]
        );
        let restored = env.cfg.status("r1", Some(4)).await.unwrap();
        let revision_two = env.cfg.status("r1", Some(2)).await.unwrap();
        assert_eq!(restored.manifest, revision_two.manifest);

        let deployment = env.mock.object("Deployment", Some("default"), "web").unwrap();
        assert_eq!(
            deployment["spec"]["template"]["spec"]["containers"][0]["image"],
            "nginx:2"
        );
    }

    #[tokio::test]
    async fn test_failure_without_baseline_keeps_error() {
        let env = env();
        env.mock
            .inject(Injection::new(Op::Create, 500).kind("Deployment").times(1));
        assert!(
            env.cfg
                .install(&hello("1"), Values::new(), &InstallOptions::new("r1", "default"), &env.cancel)
                .await
                .is_err()
        );

        env.mock
            .inject(Injection::new(Op::Patch, 500).kind("ConfigMap").times(1));
        let options = UpgradeOptions::new("r1", "default").with_rollback_on_failure();
        let err = env
            .cfg
            .upgrade(&hello("2"), Values::new(), &options, &env.cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("upgrade"));
        assert_eq!(statuses(&env).await, vec![(1, Status::Failed), (2, Status::Failed)]);
    }

    #[tokio::test]
    async fn test_repeated_upgrade_writes_nothing() {
        let env = env();
        install(&env, &hello("1")).await;
        let options = UpgradeOptions::new("r1", "default");
        env.cfg
            .upgrade(&hello("2"), Values::new(), &options, &env.cancel)
            .await
            .unwrap();

        env.mock.reset_calls();
        let third = env
            .cfg
            .upgrade(&hello("2"), Values::new(), &options, &env.cancel)
            .await
            .unwrap();
        assert_eq!(third.version, 3);
        assert_eq!(env.mock.calls().writes(), 0);
    }

    #[tokio::test]
    async fn test_removed_resource_kept_by_policy() {
        let env = env();
        let chart = hello("1").with_template(
            "templates/data.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: data\n  annotations:\n    rudder.io/resource-policy: keep\n",
        );
        install(&env, &chart).await;

        env.cfg
            .upgrade(&hello("2"), Values::new(), &UpgradeOptions::new("r1", "default"), &env.cancel)
            .await
            .unwrap();
        assert!(env.mock.object("ConfigMap", Some("default"), "data").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_upgrade_is_rejected() {
        let env = env();
        install(&env, &hello("1")).await;
        env.mock.set_status("Deployment", "web", json!({}));

        let cfg = env.cfg.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let running = tokio::spawn(async move {
            let options = UpgradeOptions::new("r1", "default").with_wait(Duration::from_secs(10));
            cfg.upgrade(&hello("2"), Values::new(), &options, &token).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = env
            .cfg
            .upgrade(&hello("3"), Values::new(), &UpgradeOptions::new("r1", "default"), &env.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::OperationInProgress { .. }));

        cancel.cancel();
        let err = running.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(statuses(&env).await, vec![(1, Status::Deployed), (2, Status::Failed)]);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_conflicting_writes() {
        let env = env_with_retry(RetryConfig {
            attempts: 10,
            initial_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(400),
            factor: 1,
        });
        install(&env, &hello("1")).await;
        env.mock
            .inject(Injection::new(Op::Patch, 409).kind("ConfigMap").times(9));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = env
            .cfg
            .upgrade(&hello("2"), Values::new(), &UpgradeOptions::new("r1", "default"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(statuses(&env).await, vec![(1, Status::Deployed), (2, Status::Failed)]);
    }
}

mod hook_lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_hooks_run_by_weight_then_name() {
        let env = env();
        let chart = hello("1")
            .with_template("templates/hooks/b.yaml", job_hook("b", "pre-install", 1))
            .with_template("templates/hooks/a.yaml", job_hook("a", "pre-install", 1))
            .with_template("templates/hooks/z.yaml", job_hook("z", "pre-install", 0));
        let release = install(&env, &chart).await;

        let mut runs: Vec<_> = release
            .hooks
            .iter()
            .map(|h| (h.last_run.started_at, h.name.clone()))
            .collect();
        runs.sort();
        let order: Vec<_> = runs.into_iter().map(|(_, name)| name).collect();
        assert_eq!(order, vec!["z", "a", "b"]);
    }

    #[tokio::test]
    async fn test_failing_hook_fails_install() {
        let env = env();
        env.mock.set_status(
            "Job",
            "migrate",
            json!({"conditions": [{"type": "Failed", "status": "True"}]}),
        );
        let chart = hello("1").with_template(
            "templates/hooks/migrate.yaml",
            job_hook("migrate", "post-install", 0),
        );

        let err = env
            .cfg
            .install(&chart, Values::new(), &InstallOptions::new("r1", "default"), &env.cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("migrate"));
        assert_eq!(statuses(&env).await, vec![(1, Status::Failed)]);
    }
}

mod uninstall_lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_keep_history() {
        let env = env();
        install(&env, &hello("1")).await;

        let kept = UninstallOptions::new("r1").with_keep_history();
        env.cfg.uninstall(&kept, &env.cancel).await.unwrap();
        assert_eq!(statuses(&env).await, vec![(1, Status::Uninstalled)]);
        assert!(env.mock.object("ConfigMap", Some("default"), "hello").is_none());

        // The name is free again
        let again = install(&env, &hello("2")).await;
        assert_eq!(again.version, 2);

        env.cfg
            .uninstall(&UninstallOptions::new("r1"), &env.cancel)
            .await
            .unwrap();
        assert!(statuses(&env).await.is_empty());
    }
}

mod wait_lifecycle {
    use super::*;
    use rudder_kube::{Builder, Reconciler};

    #[tokio::test]
    async fn test_unreachable_cluster_times_out() {
        let env = env();
        let list = Builder::new(env.mock.clone(), "default")
            .build(
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: hello\n",
                true,
            )
            .unwrap();
        let reconciler = Reconciler::new(env.mock.clone(), env.cfg.config.clone());
        assert!(reconciler.create(&list, &env.cancel).await.is_ok());

        env.mock.set_unreachable(true);
        let started = std::time::Instant::now();
        let err = reconciler
            .wait(&list, Duration::from_millis(150), false, &env.cancel)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_install_wait_timeout_is_reported_as_timeout() {
        let env = env();
        env.mock.set_status(
            "Deployment",
            "web",
            json!({"observedGeneration": 1, "availableReplicas": 0}),
        );

        let options = InstallOptions::new("r1", "default").with_wait(Duration::from_millis(100));
        let err = env
            .cfg
            .install(&hello("1"), Values::new(), &options, &env.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::ReleaseFailed { .. }));
        assert!(err.is_timeout());
        assert!(!err.is_cancelled());
        assert_eq!(statuses(&env).await, vec![(1, Status::Failed)]);
    }
}
