use corral_core::prelude::*;
use corral_engine::prelude::*;
use corral_fs::FileSystemBackend;
use corral_runtime_mock::{MockRuntime, StaticCatalog, fixtures};

use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, time::Duration};

fn install(id: &str) -> Install {
    Install {
        id: id.into(),
        app_id: "nginx".into(),
        app_name: "Nginx".into(),
        app_version: "1.2.0".into(),
        ctid: Some(100),
        status: InstallStatus::Running,
        storage: "local-lvm".into(),
        bridge: "vmbr0".into(),
        cores: 1,
        memory_mb: 512,
        disk_gb: 4,
        hostname: "nginx".into(),
        ip_address: None,
        mac_address: Some("BC:24:11:00:00:64".into()),
        onboot: true,
        unprivileged: true,
        inputs: BTreeMap::from([("http_port".to_string(), "80".to_string())]),
        outputs: BTreeMap::new(),
        mount_points: Vec::new(),
        devices: Vec::new(),
        env_vars: BTreeMap::new(),
        created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    }
}

fn entry(id: u64, message: &str) -> LogEntry {
    LogEntry {
        id,
        timestamp: Utc::now(),
        level: LogLevel::Info,
        message: message.into(),
    }
}

// ============================================================================
// Records
// ============================================================================

#[tokio::test]
async fn test_empty_root_loads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileSystemBackend::new(dir.path().join("state"));
    let snapshot = backend.load().await.unwrap();
    assert!(snapshot.jobs.is_empty());
    assert!(snapshot.logs.is_empty());
    assert!(snapshot.installs.is_empty());
    assert!(snapshot.stacks.is_empty());
}

#[tokio::test]
async fn test_records_survive_a_new_handle() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileSystemBackend::new(dir.path());

    let job = Job::new(JobKind::Install, "nginx", "Nginx");
    backend.write_job(&job).await.unwrap();
    backend.write_install(&install("a")).await.unwrap();
    backend.write_install(&install("b")).await.unwrap();
    backend.delete_install("b").await.unwrap();

    let snapshot = FileSystemBackend::new(dir.path()).load().await.unwrap();
    assert_eq!(snapshot.jobs, [job]);
    assert_eq!(snapshot.installs, [install("a")]);
    assert!(dir.path().join("installs/a.json").exists());
    assert!(!dir.path().join("installs/a.tmp").exists());
}

#[tokio::test]
async fn test_rewrite_replaces_record() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileSystemBackend::new(dir.path());
    let mut job = Job::new(JobKind::Install, "nginx", "Nginx");
    backend.write_job(&job).await.unwrap();
    job.advance(JobState::Running, None);
    job.step = Some("provision".into());
    backend.write_job(&job).await.unwrap();

    let snapshot = backend.load().await.unwrap();
    assert_eq!(snapshot.jobs, [job]);
}

#[tokio::test]
async fn test_deleting_missing_records_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileSystemBackend::new(dir.path());
    backend.delete_job("nope").await.unwrap();
    backend.delete_install("nope").await.unwrap();
    backend.delete_stack("nope").await.unwrap();
}

#[tokio::test]
async fn test_ids_cannot_escape_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileSystemBackend::new(dir.path().join("state"));
    let mut bad = install("../outside");
    let err = backend.write_install(&bad).await.unwrap_err();
    assert!(matches!(err, StorageError::System(_)));
    bad.id = String::new();
    assert!(backend.write_install(&bad).await.is_err());
    assert!(!dir.path().join("outside.json").exists());
}

#[tokio::test]
async fn test_unreadable_records_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileSystemBackend::new(dir.path());
    backend.write_install(&install("good")).await.unwrap();
    std::fs::write(dir.path().join("installs/bad.json"), b"{ not json").unwrap();
    std::fs::write(dir.path().join("installs/leftover.tmp"), b"partial").unwrap();

    let snapshot = backend.load().await.unwrap();
    assert_eq!(snapshot.installs.len(), 1);
    assert_eq!(snapshot.installs[0].id, "good");
}

// ============================================================================
// Logs
// ============================================================================

#[tokio::test]
async fn test_logs_append_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileSystemBackend::new(dir.path());
    for i in 1..=3 {
        backend
            .append_log("job-1", &entry(i, &format!("line {i}")))
            .await
            .unwrap();
    }

    let snapshot = backend.load().await.unwrap();
    let entries = &snapshot.logs["job-1"];
    assert_eq!(entries.len(), 3);
    assert_eq!(
        entries.iter().map(|e| e.id).collect::<Vec<_>>(),
        [1, 2, 3]
    );
    assert_eq!(entries[2].message, "line 3");

    let raw = std::fs::read_to_string(dir.path().join("logs/job-1.jsonl")).unwrap();
    assert_eq!(raw.lines().count(), 3);
}

#[tokio::test]
async fn test_torn_log_line_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileSystemBackend::new(dir.path());
    backend.append_log("job-1", &entry(1, "complete")).await.unwrap();
    let path = dir.path().join("logs/job-1.jsonl");
    let mut raw = std::fs::read_to_string(&path).unwrap();
    raw.push_str(r#"{"id":2,"timest"#);
    std::fs::write(&path, raw).unwrap();

    let snapshot = backend.load().await.unwrap();
    assert_eq!(snapshot.logs["job-1"].len(), 1);
}

#[tokio::test]
async fn test_delete_job_removes_its_log() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileSystemBackend::new(dir.path());
    let job = Job::new(JobKind::Uninstall, "nginx", "Nginx");
    backend.write_job(&job).await.unwrap();
    backend.append_log(&job.id, &entry(1, "hello")).await.unwrap();

    backend.delete_job(&job.id).await.unwrap();
    let snapshot = backend.load().await.unwrap();
    assert!(snapshot.jobs.is_empty());
    assert!(snapshot.logs.is_empty());
}

// ============================================================================
// Engine
// ============================================================================

#[tokio::test]
async fn test_engine_state_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let catalog = StaticCatalog::new().with_app(fixtures::nginx());
    let config = EngineConfig {
        storages: vec!["local-lvm".into()],
        bridges: vec!["vmbr0".into()],
        network_wait_interval_ms: 0,
        ..Default::default()
    };

    let services = CoreServices {
        catalog: catalog.clone(),
        runtime: runtime.clone(),
        backend: FileSystemBackend::new(dir.path()),
    };
    let engine = Corral::new(config.clone()).build(services).await.unwrap();
    let job = engine
        .start_install(InstallRequest::new("nginx"))
        .await
        .unwrap();
    let job = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_job(&job.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);
    let logs = engine.logs(&job.id).await;
    drop(engine);

    let services = CoreServices {
        catalog,
        runtime,
        backend: FileSystemBackend::new(dir.path()),
    };
    let engine = Corral::new(config).build(services).await.unwrap();
    assert_eq!(engine.get_job(&job.id).unwrap(), job);
    assert_eq!(engine.logs(&job.id).await, logs);
    let install = engine.get_install(&job.id).unwrap();
    assert_eq!(install.ctid, Some(100));
    assert!(engine.has_active_install_for_app("nginx").is_some());
}
