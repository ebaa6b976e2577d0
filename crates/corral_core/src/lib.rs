//! # Corral Core
//!
//! Types and traits shared by the corral engine and its backends.
//!
//! Defines the state model and the capabilities the engine is composed from.
//!
//! - **[`Job`](job::Job)**: An asynchronous lifecycle operation and its append-only log.
//! - **[`Install`](entity::Install)** / **[`Stack`](entity::Stack)**: Durable records of provisioned containers.
//! - **[`AppManifest`](manifest::AppManifest)**: The declarative description of an application.
//! - **[`ContainerRuntime`](traits::ContainerRuntime)**: Trait for implementing container runtime adapters.
//! - **[`StateBackend`](traits::StateBackend)**: Trait for implementing persistence layers (e.g., Filesystem).
//! - **[`Catalog`](traits::Catalog)**: Trait for looking up application manifests.

pub mod constants;
pub mod entity;
pub mod error;
pub mod job;
pub mod manifest;
pub mod request;
pub mod traits;

pub mod prelude {
    pub use super::constants::*;
    pub use super::entity::*;
    pub use super::error::*;
    pub use super::job::*;
    pub use super::manifest::*;
    pub use super::request::*;
    pub use super::traits::*;
}
