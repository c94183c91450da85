pub mod cache;
pub mod cleanup;
pub mod config;
pub mod messages;
pub mod pools;
pub mod process;
pub mod reconcile;
pub mod registry;
pub mod resources;
pub mod service;
pub mod tasklist;
pub mod watcher;

pub use service::{RmService, start_resource_manager, start_resource_manager_with};
