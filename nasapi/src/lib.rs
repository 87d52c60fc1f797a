//! Typed wrapper over the appliance's json-rpc verb surface: datasets and
//! their user properties, ZFS snapshots and clones, one-shot replication
//! jobs, NFS shares, NVMe-oF subsystems and iSCSI targets.
//!
//! Every verb translates appliance failures into the small [`ApiError`]
//! taxonomy so the CSI engine can map them onto gRPC codes without parsing
//! appliance error strings itself. The client never retries; callers are
//! idempotent and retry on `Transport` at their own pace.

#[macro_use]
extern crate tracing;

mod client;
pub mod dataset;
pub mod error;
pub mod iscsi;
pub mod nfs;
pub mod nvmet;
pub mod property;
pub mod replication;
pub mod snapshot;

pub use client::ApiClient;
pub use dataset::{Dataset, DatasetCreateParams, DatasetType};
pub use error::ApiError;
pub use snapshot::Snapshot;
