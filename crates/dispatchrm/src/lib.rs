pub mod common;
pub mod launcher;
pub mod rm;
pub mod store;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::RmError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

// ID types
pub type DispatchId = String;
pub type AllocationId = String;
pub type ResourcesId = String;
pub type TaskId = String;
pub type JobId = String;

/// Identifies the owner group of allocation requests (one group per requesting handler).
pub type GroupId = u64;

pub const DISPATCHRM_VERSION: &str = env!("CARGO_PKG_VERSION");
