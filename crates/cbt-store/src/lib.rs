//! cbt-store: concrete session and result stores.
//!
//! Implements the `LocalStore` and `RemoteStore` traits from `cbt-core` over
//! the filesystem and a PostgREST-style HTTP API, and loads the configuration
//! that selects between them.

pub mod config;
pub mod file_local;
pub mod file_remote;
pub mod rest;

pub use config::{
    create_local_store, create_remote_store, load_config_from, CbtConfig, RemoteConfig, TimerConfig,
};
pub use file_local::FileLocalStore;
pub use file_remote::FileRemoteStore;
pub use rest::RestRemoteStore;
