mod common;

use common::*;
use corral_core::prelude::*;
use corral_engine::prelude::*;
use corral_runtime_mock::{FIRST_CTID, MockOp, MockRuntime, fixtures};

use std::{collections::BTreeMap, time::Duration};

// ============================================================================
// Install
// ============================================================================

#[tokio::test]
async fn test_nginx_install() {
    let h = harness().await;
    let job = h
        .engine
        .start_install(InstallRequest::new("nginx"))
        .await
        .unwrap();
    assert_eq!(job.kind, JobKind::Install);
    assert_eq!(job.target, "nginx");
    assert_eq!(job.install_id.as_deref(), Some(job.id.as_str()));

    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);
    assert_eq!(job.ctid, Some(FIRST_CTID));
    assert_eq!(job.step.as_deref(), Some("collect_outputs"));

    let install = h.engine.get_install(&job.id).unwrap();
    assert_eq!(install.app_id, "nginx");
    assert_eq!(install.app_version, "1.2.0");
    assert_eq!(install.status, InstallStatus::Running);
    assert_eq!(install.ctid, Some(FIRST_CTID));
    assert_eq!(install.storage, "local-lvm");
    assert_eq!(install.bridge, "vmbr0");
    assert_eq!(install.hostname, "nginx");
    assert_eq!((install.cores, install.memory_mb, install.disk_gb), (1, 512, 4));
    assert_eq!(install.inputs["http_port"], "80");
    assert_eq!(install.inputs["server_name"], "localhost");
    assert_eq!(install.outputs["url"], "http://10.0.0.102:80");

    // The optional media bind has no default host path and is skipped.
    assert_eq!(install.mount_points.len(), 1);
    let data = &install.mount_points[0];
    assert_eq!(data.name, "data");
    assert_eq!(data.kind, MountKind::Volume);
    assert_eq!(data.volume_id.as_deref(), Some("local-lvm:vm-100-disk-1"));

    let container = h.runtime.container(FIRST_CTID).unwrap();
    assert!(container.running);
    assert_eq!(container.options.tags, "appstore;managed");
    assert_eq!(container.options.features, ["nesting=1"]);
    assert!(container.files.contains_key(paths::INPUTS_FILE));
    assert!(container.files.contains_key("/opt/appstore/provision/install.py"));
    assert!(
        h.runtime
            .commands()
            .iter()
            .any(|(ctid, cmd)| *ctid == FIRST_CTID && cmd.iter().any(|a| a == actions::INSTALL))
    );
}

#[tokio::test]
async fn test_bind_mount_for_media() {
    let h = harness().await;
    let mut req = InstallRequest::new("nginx");
    req.bind_mounts
        .insert("media".into(), "/mnt/storage/movies".into());
    let job = h.engine.start_install(req).await.unwrap();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);

    let install = h.engine.get_install(&job.id).unwrap();
    assert_eq!(install.mount_points.len(), 2);
    let media = &install.mount_points[1];
    assert_eq!(media.index, 1);
    assert_eq!(media.kind, MountKind::Bind);
    assert_eq!(media.host_path.as_deref(), Some("/mnt/storage/movies"));
    assert_eq!(media.mount_path, "/media");
    assert!(media.read_only);

    let container = h.runtime.container(FIRST_CTID).unwrap();
    assert_eq!(container.options.mount_points.len(), 2);
}

#[tokio::test]
async fn test_request_overrides_defaults() {
    let h = harness().await;
    let mut req = InstallRequest::new("redis");
    req.storage = Some("fast-ssd".into());
    req.bridge = Some("vmbr1".into());
    req.cores = Some(4);
    req.hostname = Some("cache".into());
    req.ip_address = Some("192.168.1.50/24".into());
    req.extra_tags = Some("db".into());
    req.inputs.insert("port".into(), "6380".into());
    let job = h.engine.start_install(req).await.unwrap();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);

    let install = h.engine.get_install(&job.id).unwrap();
    assert_eq!(install.storage, "fast-ssd");
    assert_eq!(install.bridge, "vmbr1");
    assert_eq!((install.cores, install.memory_mb), (4, 1024));
    assert_eq!(install.hostname, "cache");
    assert_eq!(install.inputs["port"], "6380");

    let container = h.runtime.container(FIRST_CTID).unwrap();
    assert_eq!(container.options.tags, "appstore;managed;db");
    assert_eq!(container.options.ip_address.as_deref(), Some("192.168.1.50/24"));
}

#[tokio::test]
async fn test_gpu_profile_uses_host_devices() {
    let h = harness().await;
    h.runtime.set_host_devices(["/dev/dri/renderD128"]);
    let job = h
        .engine
        .start_install(InstallRequest::new("jellyfin"))
        .await
        .unwrap();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);

    let install = h.engine.get_install(&job.id).unwrap();
    assert_eq!(install.devices.len(), 1);
    assert_eq!(install.devices[0].path, "/dev/dri/renderD128");
    let container = h.runtime.container(FIRST_CTID).unwrap();
    assert_eq!(container.devices, install.devices);
    assert!(container.host_mounts.is_empty());
    assert!(!commands_in(&h.runtime, FIRST_CTID).iter().any(|c| c == "ldconfig"));
}

#[tokio::test]
async fn test_optional_gpu_without_host_device() {
    let h = harness().await;
    let install = installed(&h.engine, "jellyfin").await;
    assert!(install.devices.is_empty());
}

// ============================================================================
// Container preparation: GPU runtime, base packages, SDK
// ============================================================================

fn nvidia_request() -> InstallRequest {
    let mut req = InstallRequest::new("jellyfin");
    req.gpu_profile = Some("nvidia-basic".into());
    req
}

#[tokio::test]
async fn test_nvidia_profile_mounts_libraries_and_runs_ldconfig() {
    let h = harness().await;
    h.runtime
        .set_host_devices(["/dev/nvidia0", "/dev/nvidiactl", "/dev/nvidia-uvm"]);
    h.runtime
        .set_nvidia_library_path("/usr/lib/x86_64-linux-gnu/nvidia/current");
    h.runtime.set_exec_result(
        "nvidia-smi --query-gpu=name --format=csv,noheader",
        ExecOutput {
            exit_code: 0,
            stdout: "NVIDIA RTX A2000\n".into(),
            stderr: String::new(),
        },
    );

    let job = h.engine.start_install(nvidia_request()).await.unwrap();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);

    let install = h.engine.get_install(&job.id).unwrap();
    assert_eq!(install.devices.len(), 3);
    let container = h.runtime.container(FIRST_CTID).unwrap();
    assert_eq!(container.host_mounts.len(), 1);
    let libs = &container.host_mounts[0];
    assert_eq!(
        libs.host_path.as_deref(),
        Some("/usr/lib/x86_64-linux-gnu/nvidia/current")
    );
    assert_eq!(libs.mount_path, gpu::NVIDIA_LIB_DIR);
    assert!(libs.read_only);
    // The config volume holds mp0.
    assert_eq!(libs.index, 1);
    // The library mount is not part of the install record.
    assert_eq!(install.mount_points.len(), 1);

    let commands = commands_in(&h.runtime, FIRST_CTID);
    let ldconfig = commands.iter().position(|c| c == "ldconfig").unwrap();
    let runner = commands
        .iter()
        .position(|c| c.contains("appstore.runner"))
        .unwrap();
    assert!(ldconfig < runner);
    assert!(
        commands
            .iter()
            .any(|c| c == "sh -c echo '/usr/lib/nvidia' > /etc/ld.so.conf.d/nvidia.conf")
    );

    let messages = messages(&h.engine, &job.id).await;
    assert!(messages.iter().any(|m| m == "Step: setup_gpu_runtime"));
    assert!(messages.iter().any(|m| m.ends_with("NVIDIA RTX A2000")));
}

#[tokio::test]
async fn test_nvidia_without_host_libraries_still_installs() {
    let h = harness().await;
    h.runtime
        .set_host_devices(["/dev/nvidia0", "/dev/nvidiactl", "/dev/nvidia-uvm"]);

    let job = h.engine.start_install(nvidia_request()).await.unwrap();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);

    assert!(h.runtime.container(FIRST_CTID).unwrap().host_mounts.is_empty());
    let logs = h.engine.logs(&job.id).await;
    assert!(logs.iter().any(|e| e.level == LogLevel::Warn
        && e.message.starts_with("No NVIDIA libraries found on host")));
}

#[tokio::test]
async fn test_sdk_and_templates_are_pushed() {
    let catalog = catalog().with_template("nginx", "site.conf.tmpl", "server_name {{server_name}};");
    let h = build(MockRuntime::new(), catalog, MemoryBackend::new()).await;
    installed(&h.engine, "nginx").await;

    let container = h.runtime.container(FIRST_CTID).unwrap();
    assert!(container.files.contains_key("/opt/appstore/sdk/appstore/runner.py"));
    assert!(container.files.contains_key("/opt/appstore/sdk/appstore/__init__.py"));
    assert!(container.files.contains_key("/opt/appstore/templates/site.conf.tmpl"));

    // python3 is present, so nothing is installed.
    let commands = commands_in(&h.runtime, FIRST_CTID);
    assert!(commands.iter().any(|c| c == "which python3"));
    assert!(!commands.iter().any(|c| c.starts_with("apt-get")));
}

#[tokio::test]
async fn test_missing_python_is_installed_before_provisioning() {
    let h = harness().await;
    h.runtime.set_exec_result(
        "which python3",
        ExecOutput {
            exit_code: 1,
            ..Default::default()
        },
    );
    installed(&h.engine, "nginx").await;

    let commands = commands_in(&h.runtime, FIRST_CTID);
    let position = |needle: &str| commands.iter().position(|c| c.contains(needle)).unwrap();
    assert!(position("which python3") < position("apt-get update"));
    assert!(position("apt-get update") < position("apt-get install -y python3"));
    assert!(position("apt-get install -y python3") < position("appstore.runner"));
}

#[tokio::test]
async fn test_python_install_failure_fails_the_job() {
    let h = harness().await;
    h.runtime.set_exec_result(
        "which python3",
        ExecOutput {
            exit_code: 1,
            ..Default::default()
        },
    );
    h.runtime.set_exec_result(
        "apt-get install -y python3",
        ExecOutput {
            exit_code: 100,
            stdout: String::new(),
            stderr: "E: Unable to locate package python3".into(),
        },
    );
    let job = h
        .engine
        .start_install(InstallRequest::new("nginx"))
        .await
        .unwrap();
    let job = finish(&h.engine, &job.id).await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.step.as_deref(), Some("push_sdk"));
    let error = job.error.unwrap();
    assert!(error.contains("ensuring python3"), "{error}");
    assert!(error.contains("Unable to locate package"), "{error}");
    assert!(h.engine.list_installs().is_empty());
    assert_eq!(h.runtime.destroyed(), [FIRST_CTID]);
}

#[tokio::test]
async fn test_base_packages_are_installed() {
    let config = EngineConfig {
        base_packages: vec!["curl".into(), "ca-certificates".into()],
        ..fast_config()
    };
    let h = build_with(config, MockRuntime::new(), catalog(), MemoryBackend::new()).await;
    let install = installed(&h.engine, "nginx").await;

    let commands = commands_in(&h.runtime, FIRST_CTID);
    let base = commands
        .iter()
        .position(|c| c == "apt-get install -y curl ca-certificates")
        .unwrap();
    let runner = commands
        .iter()
        .position(|c| c.contains("appstore.runner"))
        .unwrap();
    assert!(base < runner);

    // Failing base packages fail the install at that step.
    h.runtime.set_exec_result(
        "apt-get install -y curl ca-certificates",
        ExecOutput {
            exit_code: 100,
            ..Default::default()
        },
    );
    let job = h.engine.uninstall(&install.id, false).await.unwrap();
    finish(&h.engine, &job.id).await;
    let job = h
        .engine
        .start_install(InstallRequest::new("nginx"))
        .await
        .unwrap();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.step.as_deref(), Some("install_base_packages"));
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_concurrent_installs_of_same_app() {
    let h = harness().await;
    h.runtime.pause();

    let (a, b) = tokio::join!(
        h.engine.start_install(InstallRequest::new("nginx")),
        h.engine.start_install(InstallRequest::new("nginx")),
    );
    let (job, err) = match (a, b) {
        (Ok(job), Err(err)) | (Err(err), Ok(job)) => (job, err),
        other => panic!("expected exactly one admission, got {other:?}"),
    };
    match err {
        EngineError::Duplicate(dup) => assert_eq!(dup.job_id.as_deref(), Some(job.id.as_str())),
        other => panic!("expected duplicate, got {other:?}"),
    }
    assert_eq!(h.engine.list_jobs().len(), 1);
    assert_eq!(
        h.engine.has_active_job_for_app("nginx").map(|j| j.id),
        Some(job.id.clone())
    );

    h.runtime.resume();
    finish(&h.engine, &job.id).await;

    let err = h
        .engine
        .start_install(InstallRequest::new("nginx"))
        .await
        .unwrap_err();
    match err {
        EngineError::Duplicate(dup) => assert_eq!(dup.install_id.as_deref(), Some(job.id.as_str())),
        other => panic!("expected duplicate, got {other:?}"),
    }
    assert!(h.engine.has_active_install_for_app("nginx").is_some());
}

#[tokio::test]
async fn test_different_apps_install_concurrently() {
    let h = harness().await;
    let a = h
        .engine
        .start_install(InstallRequest::new("nginx"))
        .await
        .unwrap();
    let b = h
        .engine
        .start_install(InstallRequest::new("redis"))
        .await
        .unwrap();
    assert_eq!(finish(&h.engine, &a.id).await.state, JobState::Completed);
    assert_eq!(finish(&h.engine, &b.id).await.state, JobState::Completed);

    let mut ctids: Vec<_> = h.engine.list_installs().iter().filter_map(|i| i.ctid).collect();
    ctids.sort();
    assert_eq!(ctids, [FIRST_CTID, FIRST_CTID + 1]);
}

#[tokio::test]
async fn test_invalid_requests_create_no_job() {
    let h = harness().await;

    let err = h
        .engine
        .start_install(InstallRequest::new("does-not-exist"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let mut req = InstallRequest::new("nginx");
    req.cores = Some(0);
    let err = h.engine.start_install(req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let mut req = InstallRequest::new("nginx");
    req.bind_mounts.insert("media".into(), "/etc/shadow".into());
    let err = h.engine.start_install(req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let mut req = InstallRequest::new("nginx");
    req.inputs.insert("http_port".into(), "70000".into());
    let err = h.engine.start_install(req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let mut req = InstallRequest::new("nginx");
    req.env_vars.insert("PATH".into(), "/tmp".into());
    let err = h.engine.start_install(req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    assert!(h.engine.list_jobs().is_empty());
}

#[tokio::test]
async fn test_unconfigured_storage_fails_placement() {
    let h = harness().await;
    let mut req = InstallRequest::new("nginx");
    req.storage = Some("nowhere".into());
    let job = h.engine.start_install(req).await.unwrap();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.unwrap().starts_with("validate_placement"));
    assert!(h.runtime.containers().is_empty());
}

// ============================================================================
// Failure & cancellation
// ============================================================================

#[tokio::test]
async fn test_failed_provision_leaves_no_install() {
    let h = harness().await;
    h.runtime.set_provision_output(
        [r#"@@APPLOG@@{"level":"error","msg":"apt-get failed"}"#],
        1,
    );
    let job = h
        .engine
        .start_install(InstallRequest::new("nginx"))
        .await
        .unwrap();
    let job = finish(&h.engine, &job.id).await;

    assert_eq!(job.state, JobState::Failed);
    let error = job.error.unwrap();
    assert!(error.starts_with("provision"), "{error}");
    assert!(error.contains("apt-get failed"), "{error}");
    assert!(h.engine.list_installs().is_empty());
    assert!(h.runtime.containers().is_empty());
    assert_eq!(h.runtime.destroyed(), [FIRST_CTID]);

    let messages = messages(&h.engine, &job.id).await;
    assert!(messages.iter().any(|m| m == "[provision] apt-get failed"));
    assert!(messages.iter().any(|m| m.starts_with("Failed at provision")));

    // The app is free again.
    h.runtime.set_provision_output(Vec::<String>::new(), 0);
    installed(&h.engine, "nginx").await;
}

#[tokio::test]
async fn test_cancel_running_install() {
    let h = harness().await;
    h.runtime.pause();
    let job = h
        .engine
        .start_install(InstallRequest::new("nginx"))
        .await
        .unwrap();
    until_running(&h.engine, &job.id).await;

    h.engine.cancel_job(&job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.runtime.resume();

    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.error.is_none());
    assert!(h.engine.list_installs().is_empty());
    assert!(h.runtime.containers().is_empty());

    let err = h.engine.cancel_job(&job.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
    assert_eq!(h.engine.get_job(&job.id).unwrap(), job);
}

#[tokio::test]
async fn test_cancel_unknown_job() {
    let h = harness().await;
    let err = h.engine.cancel_job("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

// ============================================================================
// Uninstall & purge
// ============================================================================

#[tokio::test]
async fn test_uninstall_keeping_volumes_then_purge() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;

    let job = h.engine.uninstall(&install.id, true).await.unwrap();
    assert_eq!(job.kind, JobKind::Uninstall);
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);

    let kept = h.engine.get_install(&install.id).unwrap();
    assert_eq!(kept.status, InstallStatus::Uninstalled);
    assert!(kept.ctid.is_none());
    assert_eq!(
        kept.mount_points[0].volume_id.as_deref(),
        Some("local-lvm:vm-100-disk-1")
    );
    assert!(h.runtime.containers().is_empty());
    assert!(h.engine.has_active_install_for_app("nginx").is_none());

    let err = h.engine.uninstall(&install.id, true).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    h.engine.purge_install(&install.id).await.unwrap();
    let err = h.engine.get_install(&install.id).unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_uninstall_without_keeping_volumes_removes_record() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    let job = h.engine.uninstall(&install.id, false).await.unwrap();
    assert_eq!(finish(&h.engine, &job.id).await.state, JobState::Completed);
    assert!(h.engine.list_installs().is_empty());
    assert_eq!(h.runtime.destroyed(), [FIRST_CTID]);
}

#[tokio::test]
async fn test_uninstall_of_vanished_container() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    // Destroy the container behind the engine's back.
    h.runtime
        .destroy(FIRST_CTID, false, &Default::default())
        .await
        .unwrap();

    let job = h.engine.uninstall(&install.id, false).await.unwrap();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);
    assert!(h.engine.list_installs().is_empty());
}

#[tokio::test]
async fn test_purge_of_running_install_is_invalid_state() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    let err = h.engine.purge_install(&install.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
    assert!(h.engine.get_install(&install.id).is_ok());

    let err = h.engine.purge_install("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_purge_is_rejected_while_reinstall_is_pending() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    let job = h.engine.uninstall(&install.id, true).await.unwrap();
    assert_eq!(finish(&h.engine, &job.id).await.state, JobState::Completed);

    h.runtime.pause();
    let reinstall = h
        .engine
        .reinstall(&install.id, ReinstallRequest::default())
        .await
        .unwrap();
    let err = h.engine.purge_install(&install.id).await.unwrap_err();
    match err {
        EngineError::Duplicate(dup) => assert_eq!(dup.job_id.as_deref(), Some(reinstall.id.as_str())),
        other => panic!("expected duplicate, got {other:?}"),
    }
    assert!(h.engine.get_install(&install.id).is_ok());

    h.runtime.resume();
    let job = finish(&h.engine, &reinstall.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);
    assert_eq!(
        h.engine.get_install(&install.id).unwrap().status,
        InstallStatus::Running
    );
}

// ============================================================================
// Recreate: reinstall, update, edit
// ============================================================================

#[tokio::test]
async fn test_reinstall_reattaches_kept_volume() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;

    let err = h
        .engine
        .reinstall(&install.id, ReinstallRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let job = h.engine.uninstall(&install.id, true).await.unwrap();
    finish(&h.engine, &job.id).await;

    let req = ReinstallRequest {
        cores: Some(2),
        ..Default::default()
    };
    let job = h.engine.reinstall(&install.id, req).await.unwrap();
    assert_eq!(job.kind, JobKind::Reinstall);
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);

    let back = h.engine.get_install(&install.id).unwrap();
    assert_eq!(back.status, InstallStatus::Running);
    assert_eq!(back.cores, 2);
    let ctid = back.ctid.unwrap();
    let container = h.runtime.container(ctid).unwrap();
    assert_eq!(
        container.options.mount_points[0].volume_id.as_deref(),
        Some("local-lvm:vm-100-disk-1")
    );
}

#[tokio::test]
async fn test_update_to_newer_catalog_version() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;

    let err = h
        .engine
        .update(&install.id, UpdateRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let mut newer = fixtures::nginx();
    newer.version = "1.3.0".into();
    h.catalog.insert(newer);
    let detail = h.engine.get_install_detail(&install.id).await.unwrap();
    assert!(detail.update_available);
    assert_eq!(detail.catalog_version.as_deref(), Some("1.3.0"));

    let job = h
        .engine
        .update(&install.id, UpdateRequest::default())
        .await
        .unwrap();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);

    let updated = h.engine.get_install(&install.id).unwrap();
    assert_eq!(updated.app_version, "1.3.0");
    assert_eq!(updated.status, InstallStatus::Running);
    assert!(h.runtime.destroyed().contains(&FIRST_CTID));
    let container = h.runtime.container(updated.ctid.unwrap()).unwrap();
    assert_eq!(
        container.options.mount_points[0].volume_id.as_deref(),
        Some("local-lvm:vm-100-disk-1")
    );
    let detail = h.engine.get_install_detail(&install.id).await.unwrap();
    assert!(!detail.update_available);
}

#[tokio::test]
async fn test_edit_preserves_mac_address() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    let mac = install.mac_address.clone().unwrap();

    let shrink = EditRequest {
        disk_gb: Some(2),
        ..Default::default()
    };
    let err = h.engine.edit_install(&install.id, shrink).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let req = EditRequest {
        cores: Some(3),
        memory_mb: Some(1024),
        disk_gb: Some(6),
        inputs: BTreeMap::from([("server_name".to_string(), "example.org".to_string())]),
        ..Default::default()
    };
    let job = h.engine.edit_install(&install.id, req).await.unwrap();
    assert_eq!(job.kind, JobKind::Edit);
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);

    let edited = h.engine.get_install(&install.id).unwrap();
    assert_eq!((edited.cores, edited.memory_mb, edited.disk_gb), (3, 1024, 6));
    assert_eq!(edited.inputs["server_name"], "example.org");
    assert_eq!(edited.inputs["http_port"], "80");
    assert_eq!(edited.app_version, install.app_version);
    assert_eq!(edited.mac_address.as_deref(), Some(mac.as_str()));
    let container = h.runtime.container(edited.ctid.unwrap()).unwrap();
    assert_eq!(container.options.hw_addr.as_deref(), Some(mac.as_str()));
}

#[tokio::test]
async fn test_failed_recreate_keeps_record() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    h.runtime.set_provision_output(Vec::<String>::new(), 1);

    let job = h
        .engine
        .edit_install(&install.id, EditRequest::default())
        .await
        .unwrap();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Failed);

    // No rollback: the record is unchanged and the new container stays for inspection.
    assert_eq!(h.engine.get_install(&install.id).unwrap(), install);
    assert_eq!(h.runtime.containers().len(), 1);
    assert!(
        messages(&h.engine, &job.id)
            .await
            .iter()
            .any(|m| m.contains("left in place"))
    );
}

// ============================================================================
// Reconfigure
// ============================================================================

#[tokio::test]
async fn test_reconfigure_in_place() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;

    let req = ReconfigureRequest {
        cores: Some(2),
        memory_mb: Some(1024),
        inputs: BTreeMap::from([("server_name".to_string(), "example.org".to_string())]),
    };
    let updated = h.engine.reconfigure_install(&install.id, req).await.unwrap();
    assert_eq!((updated.cores, updated.memory_mb), (2, 1024));
    assert_eq!(updated.inputs["server_name"], "example.org");
    assert_eq!(updated.ctid, install.ctid);
    assert_eq!(h.engine.get_install(&install.id).unwrap(), updated);

    let container = h.runtime.container(FIRST_CTID).unwrap();
    assert_eq!((container.cores, container.memory_mb), (2, 1024));
    assert!(
        h.runtime
            .commands()
            .iter()
            .any(|(_, cmd)| cmd.iter().any(|a| a == actions::CONFIGURE))
    );

    let job = h
        .engine
        .list_jobs()
        .into_iter()
        .find(|j| j.kind == JobKind::Reconfigure)
        .unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn test_dropped_reconfigure_still_finishes() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    h.runtime.pause();

    let req = ReconfigureRequest {
        cores: Some(2),
        ..Default::default()
    };
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        h.engine.reconfigure_install(&install.id, req),
    )
    .await;
    assert!(abandoned.is_err());

    let job = h
        .engine
        .list_jobs()
        .into_iter()
        .find(|j| j.kind == JobKind::Reconfigure)
        .unwrap();
    assert!(!job.is_terminal());

    h.runtime.resume();
    let job = finish(&h.engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "{:?}", job.error);
    assert!(h.engine.has_active_job_for_app("nginx").is_none());
    assert_eq!(h.engine.get_install(&install.id).unwrap().cores, 2);
    assert_eq!(h.runtime.container(FIRST_CTID).unwrap().cores, 2);

    // The app is free for the next operation.
    let job = h.engine.uninstall(&install.id, true).await.unwrap();
    assert_eq!(finish(&h.engine, &job.id).await.state, JobState::Completed);
}

#[tokio::test]
async fn test_reconfigure_rejects_fixed_inputs() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;

    let req = ReconfigureRequest {
        inputs: BTreeMap::from([("http_port".to_string(), "8080".to_string())]),
        ..Default::default()
    };
    let err = h.engine.reconfigure_install(&install.id, req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let req = ReconfigureRequest {
        inputs: BTreeMap::from([("nope".to_string(), "1".to_string())]),
        ..Default::default()
    };
    let err = h.engine.reconfigure_install(&install.id, req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    // Unchanged values pass through.
    let req = ReconfigureRequest {
        inputs: BTreeMap::from([("http_port".to_string(), "80".to_string())]),
        ..Default::default()
    };
    h.engine.reconfigure_install(&install.id, req).await.unwrap();
}

#[tokio::test]
async fn test_reconfigure_failure_is_execution_error() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    h.runtime.fail(MockOp::UpdateResources, "cgroup write failed");

    let req = ReconfigureRequest {
        cores: Some(4),
        ..Default::default()
    };
    let err = h.engine.reconfigure_install(&install.id, req).await.unwrap_err();
    match err {
        EngineError::Execution(msg) => assert!(msg.contains("cgroup write failed"), "{msg}"),
        other => panic!("expected execution error, got {other:?}"),
    }
    assert_eq!(h.engine.get_install(&install.id).unwrap().cores, install.cores);
    // The app is not left locked.
    h.runtime.clear_failure(MockOp::UpdateResources);
    let req = ReconfigureRequest {
        cores: Some(4),
        ..Default::default()
    };
    h.engine.reconfigure_install(&install.id, req).await.unwrap();
}

// ============================================================================
// Power & enrichment
// ============================================================================

#[tokio::test]
async fn test_stop_start_restart() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;

    h.engine.stop_container(&install.id).await.unwrap();
    assert!(!h.runtime.container(FIRST_CTID).unwrap().running);
    assert_eq!(
        h.engine.get_install(&install.id).unwrap().status,
        InstallStatus::Stopped
    );

    h.engine.start_container(&install.id).await.unwrap();
    assert!(h.runtime.container(FIRST_CTID).unwrap().running);

    h.engine.restart_container(&install.id).await.unwrap();
    assert!(h.runtime.container(FIRST_CTID).unwrap().running);
    assert_eq!(
        h.engine.get_install(&install.id).unwrap().status,
        InstallStatus::Running
    );

    let err = h.engine.start_container("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_power_on_uninstalled_is_invalid_state() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    let job = h.engine.uninstall(&install.id, true).await.unwrap();
    finish(&h.engine, &job.id).await;

    let err = h.engine.start_container(&install.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
    let err = h.engine.restart_container(&install.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test]
async fn test_enrichment_reports_live_state() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    h.runtime
        .stop(FIRST_CTID, &Default::default())
        .await
        .unwrap();

    let detail = h.engine.get_install_detail(&install.id).await.unwrap();
    assert_eq!(detail.record.status, InstallStatus::Stopped);
    assert_eq!(detail.live.unwrap().state, ContainerState::Stopped);
    assert!(detail.ip.is_none());
    assert!(!detail.update_available);
}

#[tokio::test]
async fn test_enrichment_degrades_when_status_fails() {
    let h = harness().await;
    let install = installed(&h.engine, "nginx").await;
    h.runtime.fail_status(FIRST_CTID);

    let listed = h.engine.list_installs_enriched().await;
    assert_eq!(listed.len(), 1);
    let detail = &listed[0];
    assert!(detail.live.is_none());
    assert!(detail.uptime_secs.is_none());
    assert_eq!(detail.record.status, InstallStatus::Running);
    assert_eq!(detail.ip.as_deref(), Some("10.0.0.102"));
    assert_eq!(detail.record.id, install.id);
}
