//! Container management module for sandpool
//!
//! Handles the sandbox side of an execution:
//! - Building the locked-down container profile
//! - Creating, leasing and destroying pooled containers
//! - Running a script inside a container

mod executor;
pub mod handle;
pub mod pool;
pub mod profile;

pub use executor::{quote_script, ScriptExecutor};
pub use handle::{ContainerHandle, ContainerState};
pub use pool::{custom_pool_name, ContainerPool, Lease, PoolSettings};
pub use profile::SandboxProfile;
