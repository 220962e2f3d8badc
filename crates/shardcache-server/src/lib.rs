//! Shardcache Server - HTTP surfaces of the master and auxiliary roles
//!
//! The master routes client traffic over the hash ring and absorbs
//! handoffs; each auxiliary serves one LRU store and snapshots it to disk.

mod auxiliary;
mod error;
mod master;
mod metrics;
mod shutdown;

pub use auxiliary::{auxiliary_router, AuxiliaryServer, AuxiliaryState};
pub use error::{ApiError, ApiResult};
pub use master::{master_router, MasterServer, MasterState};
pub use metrics::{MetricsRecorder, Role};
pub use shutdown::shutdown_signal;
