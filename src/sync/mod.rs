//! Now-playing synchronization core.

pub mod controller;
pub mod debouncer;
pub mod metadata_cache;
pub mod override_guard;
pub mod placeholder;
pub mod recovery;
mod timer;
