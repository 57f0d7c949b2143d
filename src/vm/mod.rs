//! VM management module
//!
//! - `record` - VM records and lifecycle status
//! - `backend` - virtualization backend boundary
//! - `multipass` - Multipass CLI backend
//! - `executor` - runs operations and streams their events
//! - `inventory` - shared cache of VM state

pub mod backend;
pub mod executor;
pub mod inventory;
pub mod multipass;
pub mod record;

pub use backend::{BackendError, BackendRequest, LaunchSpec, ProgressSink, VirtBackend};
pub use executor::{BackendExecutor, ExecuteError, OperationStream};
pub use inventory::{InventoryCache, RefreshError};
pub use multipass::MultipassBackend;
pub use record::{VmRecord, VmStatus};
