//! SPDK CSI Driver Library
//!
//! Kubernetes CSI driver that provisions logical volumes on SPDK storage
//! endpoints and attaches them to nodes over NVMe-oF, iSCSI or through a
//! storage offload accelerator (SMA or OPI).
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - Storage backends speaking SPDK JSON-RPC or the cluster REST API
//! - Host and accelerator initiators that turn a volume context into a
//!   local block device

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

/// Storage Management Agent proto generated types
pub mod sma {
    tonic::include_proto!("sma");
}

/// OPI storage proto generated types
pub mod opi {
    tonic::include_proto!("opi_api.storage.v1");
}

pub mod backend;
pub mod config;
pub mod context;
pub mod controller;
pub mod endpoints;
pub mod error;
pub mod identity;
pub mod initiator;
pub mod locks;
pub mod metrics;
pub mod node;
pub mod platform;
pub mod retry;
pub mod scheduler;
pub mod target;
pub mod undo;

pub use controller::ControllerService;
pub use endpoints::{BackendProvider, ConfiguredEndpoints};
pub use error::{CsiError, Result};
pub use identity::{DRIVER_NAME, DRIVER_VERSION, IdentityService};
pub use initiator::NodeEnv;
pub use node::NodeService;
