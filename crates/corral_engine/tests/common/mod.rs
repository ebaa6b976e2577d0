#![allow(dead_code)]

use corral_core::prelude::*;
use corral_engine::prelude::*;
use corral_runtime_mock::{MockRuntime, StaticCatalog, fixtures};

use std::time::Duration;

pub type TestServices = CoreServices<StaticCatalog, MockRuntime, MemoryBackend>;

pub struct Harness {
    pub engine: Engine<TestServices>,
    pub runtime: MockRuntime,
    pub catalog: StaticCatalog,
    pub backend: MemoryBackend,
}

/// No pauses and few retries, so failure paths finish quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        storages: vec!["local-lvm".into(), "fast-ssd".into()],
        bridges: vec!["vmbr0".into(), "vmbr1".into()],
        destroy_attempts: 2,
        destroy_retry_delay_ms: 0,
        network_wait_attempts: 2,
        network_wait_interval_ms: 0,
        shutdown_timeout_secs: 1,
        restart_delay_ms: 0,
        recreate_settle_ms: 0,
        ..Default::default()
    }
}

pub fn catalog() -> StaticCatalog {
    StaticCatalog::new()
        .with_app(fixtures::nginx())
        .with_app(fixtures::redis())
        .with_app(fixtures::jellyfin())
}

pub async fn harness() -> Harness {
    build(MockRuntime::new(), catalog(), MemoryBackend::new()).await
}

pub async fn build(runtime: MockRuntime, catalog: StaticCatalog, backend: MemoryBackend) -> Harness {
    build_with(fast_config(), runtime, catalog, backend).await
}

pub async fn build_with(
    config: EngineConfig,
    runtime: MockRuntime,
    catalog: StaticCatalog,
    backend: MemoryBackend,
) -> Harness {
    let services = CoreServices {
        catalog: catalog.clone(),
        runtime: runtime.clone(),
        backend: backend.clone(),
    };
    let engine = Corral::new(config)
        .build(services)
        .await
        .expect("engine builds");
    Harness {
        engine,
        runtime,
        catalog,
        backend,
    }
}

/// Waits with a timeout so a hung job fails the test instead of blocking it.
pub async fn finish(engine: &Engine<TestServices>, job_id: &str) -> Job {
    tokio::time::timeout(Duration::from_secs(5), engine.wait_for_job(job_id))
        .await
        .expect("job finishes in time")
        .expect("job exists")
}

/// Every command run in `ctid`, space-joined, in order.
pub fn commands_in(runtime: &MockRuntime, ctid: u32) -> Vec<String> {
    runtime
        .commands()
        .into_iter()
        .filter(|(id, _)| *id == ctid)
        .map(|(_, cmd)| cmd.join(" "))
        .collect()
}

/// Polls until the job has left `queued`.
pub async fn until_running(engine: &Engine<TestServices>, job_id: &str) {
    for _ in 0..200 {
        if engine.get_job(job_id).expect("job exists").state != JobState::Queued {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job_id} never started");
}

/// Installs `app_id` with defaults and returns the completed install.
pub async fn installed(engine: &Engine<TestServices>, app_id: &str) -> Install {
    let job = engine
        .start_install(InstallRequest::new(app_id))
        .await
        .expect("install admitted");
    let job = finish(engine, &job.id).await;
    assert_eq!(job.state, JobState::Completed, "install failed: {:?}", job.error);
    engine
        .get_install(job.install_id.as_deref().expect("install id"))
        .expect("install stored")
}

pub async fn messages(engine: &Engine<TestServices>, job_id: &str) -> Vec<String> {
    engine
        .logs(job_id)
        .await
        .into_iter()
        .map(|e| e.message)
        .collect()
}
