//! # Corral
//!
//! An install and stack orchestration engine for system containers.
//!
//! Apps are described by catalog manifests. Each install, uninstall, edit or stack request
//! becomes a tracked, cancellable job that drives a container runtime, with persisted logs
//! and crash recovery.
//!
//! This crate serves as an entry point, re-exporting the core types and the engine, and
//! optionally including state backends and a development runtime via feature flags.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **`fs`** | State backend for the local filesystem (`corral_fs`). |
//! | **`mock`** | In-memory container runtime and static catalog (`corral_runtime_mock`). |
//!
//! ## Example: Mock Engine
//!
//! ```toml
//! [dependencies]
//! corral = { version = "0.3", features = ["fs", "mock"] }
//! ```
//!
//! ```rust,no_run
//! use corral::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> corral::error::Result<()> {
//!     let services = CoreServices {
//!         catalog: StaticCatalog::new().with_app(fixtures::nginx()),
//!         runtime: MockRuntime::new(),
//!         backend: FileSystemBackend::new("./corral_data"),
//!     };
//!
//!     let config = EngineConfig {
//!         storages: vec!["local-lvm".into()],
//!         bridges: vec!["vmbr0".into()],
//!         ..Default::default()
//!     };
//!     let engine = Corral::new(config).build(services).await?;
//!
//!     let job = engine.start_install(InstallRequest::new("nginx")).await?;
//!     engine.wait_for_job(&job.id).await?;
//!     Ok(())
//! }
//! ```

pub use corral_core::*;

pub mod engine {
    pub use corral_engine::*;
}

#[cfg(feature = "fs")]
pub mod fs {
    pub use corral_fs::*;
}

#[cfg(feature = "mock")]
pub mod mock {
    pub use corral_runtime_mock::*;
}

pub mod prelude {
    pub use corral_core::prelude::*;
    pub use corral_engine::prelude::*;

    #[cfg(feature = "fs")]
    pub use corral_fs::FileSystemBackend;

    #[cfg(feature = "mock")]
    pub use corral_runtime_mock::{MockRuntime, StaticCatalog, fixtures};
}
