//! Capability-gated extension host.
//!
//! Extensions declare what they need in a manifest (permissions plus
//! owned storage collections) and run in isolated workers that talk to
//! the trusted host over a JSON message protocol. The host owns every
//! privileged resource: a SQLite-backed key/value and document store,
//! encrypted secrets, outbound HTTP, and the embedding application's
//! surfaces. Workers get exactly the capabilities their manifest was
//! granted, enforced on both sides of the boundary.
//!
//! The main pieces:
//! - [`manifest`]: extension.toml parsing and validation
//! - [`permissions`]: capability grants, wildcards, identifier rules
//! - [`protocol`] / [`transport`]: the wire messages and how they move
//! - [`runtime`]: the worker-side runtime and the extension-facing API
//! - [`host`]: the trusted coordinator and capability fulfillment
//! - [`storage`] / [`secrets`]: persistence behind the capabilities
//! - [`tasks`]: supervised background jobs with cooperative cancel

pub mod config;
pub mod error;
pub mod host;
pub mod manifest;
pub mod pending;
pub mod permissions;
pub mod protocol;
pub mod runtime;
pub mod secrets;
pub mod storage;
pub mod tasks;
pub mod transport;

pub use config::HostConfig;
pub use error::{HostError, HostResult};
pub use host::{
    ExecutionOutcome, ExtensionFactory, ExtensionHost, HostDelegate, HostEvent, TaskWorkerSpawner,
    WorkerSpawner,
};
pub use manifest::ExtensionManifest;
pub use runtime::{Extension, ExtensionContext, ExtensionRuntime};
