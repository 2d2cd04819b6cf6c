//! wgmesh Common Library
//!
//! Shared data model, storage and peer computation for the wgmesh control plane.

pub mod crypto;
pub mod db;
pub mod error;
pub mod peers;
pub mod types;

// Re-export commonly used types
pub use crypto::{KeyPair, Signer, Verifier, WgKeyPair};
pub use db::Database;
pub use error::{Error, ErrorKind, Result};
pub use peers::Snapshot;
pub use types::*;

/// wgmesh version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".wgmesh")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
