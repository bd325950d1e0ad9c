use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use servergroup::discovery::FileSdConfig;
use servergroup::{Config, Format, GroupError, ServerGroup, TargetGroup};

use testify::temp::temp_dir;
use testify::trace::trace_init;
use testify::wait::wait_for;

fn config(text: &str) -> Config {
    Config::load_from_str(text, Format::YAML).unwrap()
}

/// Every target of a round carries the round number as its port, a reader
/// must never see two rounds mixed in one snapshot.
fn round(n: usize) -> Vec<TargetGroup> {
    let size = n % 7 + 1;

    (0..size)
        .map(|index| {
            TargetGroup::from_addresses(index.to_string(), [format!("10.0.0.{index}:{n}")])
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_see_whole_snapshots() {
    trace_init();

    let group = Arc::new(ServerGroup::builder().name("concurrent").build());
    group.apply_config(Config::default()).unwrap();
    // no discovery sources, the target set publishes an empty list once
    group.ready().await.unwrap();
    let base = group.targets().version();

    let stop = Arc::new(AtomicBool::new(false));
    let readers = (0..4)
        .map(|_| {
            let group = Arc::clone(&group);
            let stop = Arc::clone(&stop);

            tokio::spawn(async move {
                let mut last = 0;

                while !stop.load(Ordering::Acquire) {
                    let snapshot = group.targets();
                    assert!(snapshot.version() >= last, "version went backwards");
                    last = snapshot.version();

                    if let Some(first) = snapshot.first() {
                        let port = first.rsplit(':').next().unwrap();
                        let n = port.parse::<usize>().unwrap();

                        assert_eq!(snapshot.len(), n % 7 + 1);
                        assert!(snapshot.iter().all(|url| url.ends_with(&format!(":{port}"))));
                    }

                    tokio::task::yield_now().await;
                }
            })
        })
        .collect::<Vec<_>>();

    for n in 1..=500 {
        group.sync(&round(n));
        if n % 50 == 0 {
            tokio::task::yield_now().await;
        }
    }

    group.cancel();
    stop.store(true, Ordering::Release);

    for reader in readers {
        reader.await.unwrap();
    }

    let snapshot = group.targets();
    assert_eq!(snapshot.version(), base + 500);
    assert_eq!(snapshot.len(), 500 % 7 + 1);
    assert_eq!(snapshot[0], "http://10.0.0.0:500");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sync_and_apply() {
    trace_init();

    let group = Arc::new(ServerGroup::new());
    let writers = (0..4)
        .map(|writer| {
            let group = Arc::clone(&group);

            tokio::spawn(async move {
                for n in 0..100 {
                    if n % 10 == writer {
                        let scheme = if n % 2 == 0 { "http" } else { "https" };
                        group
                            .apply_config(config(&format!("scheme: {scheme}")))
                            .unwrap();
                    }

                    group.sync(&round(n));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect::<Vec<_>>();

    for writer in writers {
        writer.await.unwrap();
    }

    // every sync publishes a version of its own
    let snapshot = group.targets();
    assert!(snapshot.version() >= 400);
    assert!(
        snapshot
            .iter()
            .all(|url| url.starts_with("http://") || url.starts_with("https://"))
    );
}

#[tokio::test]
async fn file_discovery_end_to_end() {
    trace_init();

    let dir = temp_dir();
    let path = dir.join("targets.yaml");
    std::fs::write(
        &path,
        r#"
- targets: ["10.0.0.1:8080", "192.168.0.1:8080"]
  labels:
    env: prod
- targets: ["192.168.0.2:8080"]
  labels:
    env: dev
"#,
    )
    .unwrap();

    let group = ServerGroup::builder().name("file").build();
    group
        .apply_config(config(&format!(
            r#"
scheme: https
relabel_configs:
  - source_labels: [__address__]
    regex: '10\..*'
    action: drop
  - source_labels: [env]
    regex: prod
    action: keep
file_sd_configs:
  - files: ["{}/*.yaml"]
    refresh_interval: 50ms
"#,
            dir.display()
        )))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), group.ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.targets().to_vec(), vec!["https://192.168.0.1:8080"]);

    std::fs::write(
        &path,
        r#"[{"targets": ["192.168.0.3:8080", "192.168.0.4:8080"], "labels": {"env": "prod"}}]"#,
    )
    .unwrap();

    let group = &group;
    wait_for(|| async move {
        group.targets().to_vec() == vec!["https://192.168.0.3:8080", "https://192.168.0.4:8080"]
    })
    .await;

    std::fs::remove_file(&path).unwrap();
    wait_for(|| async move { group.targets().is_empty() }).await;

    group.cancel();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn replace_discovery_sources() {
    trace_init();

    let group = &ServerGroup::new();
    group
        .apply_config(config("static_configs: [{targets: ['a:80', 'b:80']}]"))
        .unwrap();
    wait_for(|| async move {
        group.targets().to_vec() == vec!["http://a:80", "http://b:80"]
    })
    .await;

    group
        .apply_config(config("static_configs: [{targets: ['c:80']}]"))
        .unwrap();
    wait_for(|| async move {
        group.targets().to_vec() == vec!["http://c:80"]
    })
    .await;

    // no sources left publishes an empty list
    group.apply_config(Config::default()).unwrap();
    wait_for(|| async move {
        group.targets().is_empty()
    })
    .await;
}

#[tokio::test]
async fn invalid_discovery_is_rejected() {
    let group = ServerGroup::new();

    let mut invalid = Config::default();
    invalid.hosts.file_sd_configs.push(FileSdConfig {
        files: vec!["/tmp/[.yaml".to_string()],
        refresh_interval: Duration::from_secs(60),
    });

    let result = group.apply_config(invalid);
    assert!(matches!(result, Err(GroupError::Discovery(_))));
    // nothing was installed
    assert!(group.config().is_none());
    assert!(!group.is_ready());
}

#[tokio::test]
async fn cancel_stops_discovery() {
    trace_init();

    let dir = temp_dir();
    let path = dir.join("targets.json");
    std::fs::write(&path, r#"[{"targets": ["a:80"]}]"#).unwrap();

    let group = ServerGroup::new();
    let mut config = Config::default();
    config.hosts.file_sd_configs.push(FileSdConfig {
        files: vec![format!("{}/*.json", dir.display())],
        refresh_interval: Duration::from_millis(20),
    });
    group.apply_config(config).unwrap();

    tokio::time::timeout(Duration::from_secs(5), group.ready())
        .await
        .unwrap()
        .unwrap();
    let version = group.targets().version();

    group.cancel();
    assert!(group.is_cancelled());

    std::fs::write(&path, r#"[{"targets": ["b:80"]}]"#).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the last snapshot stays, nothing new is published
    assert_eq!(group.targets().version(), version);
    assert_eq!(group.targets().to_vec(), vec!["http://a:80"]);

    std::fs::remove_dir_all(&dir).unwrap();
}

fn wide_round(n: usize) -> Vec<TargetGroup> {
    (0..50)
        .map(|index| TargetGroup::from_addresses(index.to_string(), [format!("h{index}:{n}")]))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshots_never_mix_schemes_and_survive_cancel() {
    trace_init();

    let group = Arc::new(ServerGroup::builder().name("isolation").build());
    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let group = Arc::clone(&group);
        let stop = Arc::clone(&stop);

        tokio::spawn(async move {
            while !stop.load(Ordering::Acquire) {
                let snapshot = group.targets();
                if let Some(first) = snapshot.first() {
                    let scheme = &first[..first.find("://").unwrap()];
                    assert!(
                        snapshot
                            .iter()
                            .all(|url| url.starts_with(&format!("{scheme}://"))),
                        "mixed schemes in version {}",
                        snapshot.version()
                    );
                    assert_eq!(snapshot.len(), 50);
                }

                tokio::task::yield_now().await;
            }
        })
    };

    let writers = (0..4)
        .map(|writer| {
            let group = Arc::clone(&group);

            tokio::spawn(async move {
                for n in 0..300usize {
                    let scheme = if (n + writer) % 2 == 0 { "http" } else { "https" };
                    // fails once cancelled, sync keeps publishing
                    let _ = group.apply_config(config(&format!("scheme: {scheme}")));
                    group.sync(&wide_round(n));

                    if writer == 0 && n == 150 {
                        group.cancel();
                    }

                    tokio::task::yield_now().await;
                }
            })
        })
        .collect::<Vec<_>>();

    for writer in writers {
        writer.await.unwrap();
    }
    stop.store(true, Ordering::Release);
    reader.await.unwrap();

    assert!(group.is_cancelled());
    let snapshot = group.targets();
    assert_eq!(snapshot.len(), 50);
    assert!(snapshot.version() >= 1200);
    assert!(matches!(
        group.apply_config(Config::default()),
        Err(GroupError::Cancelled)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn apply_rejected_by_cancel_is_not_installed() {
    trace_init();

    for _ in 0..20 {
        let group = Arc::new(ServerGroup::new());

        let appliers = (0..4)
            .map(|applier| {
                let group = Arc::clone(&group);

                tokio::spawn(async move {
                    let mut accepted = vec![];
                    for n in 0..25usize {
                        // the rule count tells the configs apart
                        let rules = applier * 25 + n;
                        let mut config = Config::default();
                        config.relabel_configs = vec![Default::default(); rules];
                        for rule in &mut config.relabel_configs {
                            rule.target_label = "marker".to_string();
                        }

                        match group.apply_config(config) {
                            Ok(()) => accepted.push(rules),
                            Err(GroupError::Cancelled) => {}
                            Err(err) => panic!("unexpected error {err}"),
                        }

                        tokio::task::yield_now().await;
                    }

                    accepted
                })
            })
            .collect::<Vec<_>>();

        tokio::task::yield_now().await;
        group.cancel();

        let mut accepted = vec![];
        for applier in appliers {
            accepted.extend(applier.await.unwrap());
        }

        if let Some(config) = group.config() {
            assert!(accepted.contains(&config.relabel_configs.len()));
        }
    }
}
