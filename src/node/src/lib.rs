//! permsync node library
//!
//! Hosts a [`permsync_engine::PermissionEngine`] behind a TOML configuration:
//! backend selection, invalidation transport, logging and bulk
//! export/import for moving data between backends.

pub mod config;
pub mod node;

pub use config::NodeConfig;
pub use node::PermsNode;
