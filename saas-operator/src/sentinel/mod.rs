//! Sentinel pool management & event watching.

mod pool;
mod watcher;
#[cfg(test)]
mod watcher_test;

pub use pool::SentinelPool;
pub use watcher::{EventWatcher, RECONNECT_DELAY};
