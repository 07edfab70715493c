pub mod admin;
pub mod config;
pub mod error;
pub mod health;
pub mod pool;
pub mod proxy;
pub mod sources;
pub mod sticky;
pub mod tls;
pub mod updater;
pub mod upstream;
pub mod xray;

// Re-export commonly used types
pub use error::{RotapoolError, RotapoolResult};
pub use pool::{pick_rendezvous, Entry, Pool, Stats};
pub use sticky::StickyMap;
pub use updater::{Updater, UpdaterStatus, XrayHandles};
