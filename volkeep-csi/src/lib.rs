//! volkeep-csi: controller side of a CSI block-storage plugin.
//!
//! The controller validates volume requests, serializes create, delete and
//! validate calls per volume name, and hands the actual allocation to a
//! pluggable [`Backend`].

// Generated protobuf code has doc formatting issues
#![allow(clippy::doc_overindented_list_items)]
#![allow(clippy::doc_lazy_continuation)]
// tonic::Status is large by design (176 bytes)
#![allow(clippy::result_large_err)]

pub mod backend;
pub mod capability;
pub mod config;
pub mod context;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod keylock;

pub mod csi {
    tonic::include_proto!("csi.v1");

    pub use prost_types::Timestamp;

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("csi_descriptor");
}

pub use backend::{Backend, MemoryBackend};
pub use config::Config;
pub use context::CallContext;
pub use driver::{Driver, DriverState};
pub use error::{Error, Result};
pub use keylock::{KeyGuard, KeyLock};

#[cfg(test)]
pub(crate) mod test_util;
