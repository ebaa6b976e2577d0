//! # Mock Install Example
//!
//! Runs the engine against the in-memory [`MockRuntime`] with state persisted under `./corral_data`.
//! Installs a single app, follows its log, provisions a stack and prints the export bundle.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --example mock_install --features "mock fs"
//! ```

use corral::prelude::*;
use std::{env, time::Duration};

async fn follow<S: corral::traits::EngineServices>(
    engine: &Engine<S>,
    job_id: &str,
) -> anyhow::Result<Job> {
    let mut cursor = 0;
    loop {
        let (entries, last) = engine.logs_since(job_id, cursor).await;
        for entry in entries {
            println!("[{:?}] {}", entry.level, entry.message);
        }
        cursor = last;

        let job = engine.get_job(job_id)?;
        if job.state.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // Providers & Services
    let catalog = StaticCatalog::new()
        .with_app(fixtures::nginx())
        .with_app(fixtures::redis());
    let runtime = MockRuntime::new();
    let data_dir = env::var("CORRAL_DATA").unwrap_or_else(|_| "./corral_data".to_string());
    let backend = FileSystemBackend::new(data_dir);

    let services = CoreServices {
        catalog,
        runtime,
        backend,
    };

    let config = EngineConfig {
        storages: vec!["local-lvm".into()],
        bridges: vec!["vmbr0".into()],
        ..Default::default()
    };

    // Build Engine
    let engine = Corral::new(config).build(services).await?;

    // Single app
    let job = match engine.start_install(InstallRequest::new("nginx")).await {
        Ok(job) => follow(&engine, &job.id).await?,
        Err(EngineError::Duplicate(dup)) => {
            println!("{dup}");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("Install {} finished: {}", job.id, job.state);

    // Stack
    let request = StackCreateRequest {
        name: "cache".into(),
        apps: vec![StackAppRequest {
            app_id: "redis".into(),
            ..Default::default()
        }],
        ..Default::default()
    };
    let validation = engine.validate_stack(&request);
    for warning in &validation.warnings {
        println!("warning: {warning}");
    }
    let job = engine.start_stack(request).await?;
    let job = follow(&engine, &job.id).await?;
    println!("Stack {} finished: {}", job.id, job.state);

    // Export
    let bundle = engine.export_all();
    println!("{}", serde_json::to_string_pretty(&bundle)?);

    Ok(())
}
