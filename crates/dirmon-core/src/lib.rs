//! dirmon-core - client-side core of the monitored-directory console.
//!
//! Provides:
//! - `model` - directory records, create/patch inputs, input validation
//! - `error` - error taxonomy shared by every operation
//! - `client` - remote resource abstraction and its HTTP implementation
//! - `cache` - in-memory snapshot of the directory collection
//! - `mutation` - optimistic create/update/toggle/delete with rollback
//! - `telemetry` - batched, best-effort error reporting
//! - `config` - settings consumed at startup
//! - `mock` - in-memory remote for tests and offline runs

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod mock;
pub mod model;
pub mod mutation;
pub mod telemetry;

pub use cache::{CacheSnapshot, ResourceCache};
pub use client::{HttpClient, RemoteResourceClient};
pub use config::Settings;
pub use error::Error;
pub use model::{Directory, DirectoryCreate, DirectoryUpdate};
pub use mutation::MutationCoordinator;
pub use telemetry::{
    ErrorEntry, ErrorSource, LoggingPolicy, ReportedError, SourcePolicy, TelemetryBuffer,
};

/// Crate version, used in the default environment string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
