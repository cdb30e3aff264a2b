//! standctl: per-user lab stands on a Proxmox VE cluster
//!
//! Stands are provisioned from a YAML stand definition. Every user gets
//! an account, a pool, clones of the stand's templates and private
//! bridges for its symbolic networks.

pub mod balancing;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod deploy;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod network;
pub mod tasks;
pub mod templates;

pub use error::{StandError, StandResult};
