//! # Corral Engine
//!
//! Turns install, uninstall, edit and stack requests into tracked, cancellable jobs
//! that drive a [`ContainerRuntime`](corral_core::traits::ContainerRuntime).
//!
//! Provides the [`Corral`] builder, which ties together a catalog, a runtime and a
//! state backend into an [`Engine`].
//!
//! ## Concurrency
//!
//! * At most one job per app id or stack is in flight; a second request fails fast with
//!   [`EngineError::Duplicate`](corral_core::error::EngineError::Duplicate).
//! * At most [`EngineConfig::max_concurrent_jobs`] workers run at once; the rest stay `queued`.
//! * Cancellation is cooperative and observed between steps and inside runtime calls.
//!
//! ## Example
//!
//! ```no_run
//! use corral_engine::prelude::*;
//! # use corral_core::prelude::*;
//!
//! # async fn run<C: Catalog, R: ContainerRuntime>(catalog: C, runtime: R) -> corral_core::error::Result<()> {
//! let services = CoreServices {
//!     catalog,
//!     runtime,
//!     backend: MemoryBackend::new(),
//! };
//! let engine = Corral::new(EngineConfig::default()).build(services).await?;
//!
//! let job = engine.start_install(InstallRequest::new("nginx")).await?;
//! let job = engine.wait_for_job(&job.id).await?;
//! println!("{} finished: {}", job.id, job.state);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod guard;
pub mod logs;
pub mod memory;
pub mod recipe;
pub mod resolver;
pub mod scheduler;
pub mod services;
pub mod store;
pub mod validate;

mod engine;
mod install;
mod pipeline;
mod stack;

pub use engine::{Corral, Engine};
pub use pipeline::Step;

pub mod prelude {
    pub use crate::config::{EngineConfig, GpuConfig, GpuPolicy, ResourceDefaults};
    pub use crate::memory::MemoryBackend;
    pub use crate::recipe::{ApplyResult, ExportBundle, InstallRecipe, StackRecipe};
    pub use crate::services::CoreServices;
    pub use crate::{Corral, Engine, Step};
}
