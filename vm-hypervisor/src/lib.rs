//! Hypervisor gateway library.
//!
//! A thin authenticated client for the cluster's HTTP management API. Every
//! request either returns data synchronously or hands back an opaque task
//! handle to poll. Remote failures are parsed once into a typed taxonomy so
//! callers can dispatch on [`RemoteErrorKind`] instead of error text.

pub mod client;
pub mod config;
pub mod disk;
pub mod error;
pub mod gateway;
pub mod types;

// When the `test-helpers` feature is enabled, include the scripted mock gateway.
#[cfg(feature = "test-helpers")]
pub mod mock;

pub use client::HypervisorClient;
pub use config::ClusterConfig;
pub use disk::{format_size, parse_size_bytes, DiskDescriptor, GIB, MIB};
pub use error::{GatewayError, RemoteApiError, RemoteErrorKind, Result};
pub use gateway::Gateway;
pub use types::{
    CloneOptions, GatewayResponse, PowerAction, RemoteVmConfig, RemoteVmId, TaskHandle,
    TaskState, TaskStatus, VmRuntimeStatus, TASK_EXIT_OK,
};

pub use reqwest::Method;
