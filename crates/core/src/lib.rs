//! Shared-memory suffix-tree rollout cache.
//!
//! A cache server receives rollout uploads (a prompt plus the responses
//! sampled for it), builds a generalized suffix tree over the concatenated
//! token stream, and publishes the tree in a fixed-size shared-memory arena.
//! Inference workers on the same host attach to the arena and speculate
//! short token continuations against the tree, weighted by subtree
//! frequencies, for speculative decoding.
//!
//! The main entry points are [`RolloutStore`] (owner side: upload, evict)
//! and [`SuffixCacheReader`] (worker side: attach, speculate, adapt the
//! speculation length per request).

pub mod arena;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod reader;
pub mod registry;
pub mod store;
pub mod suffix_tree;

pub use arena::SharedArena;
pub use config::{ArenaConfig, SpeculationConfig};
pub use error::CacheError;
pub use fingerprint::prompt_fingerprint;
pub use reader::SuffixCacheReader;
pub use store::{RolloutStore, StoreStats};
pub use suffix_tree::{SpecParams, SpecResult, SuffixTree, Token, SENTINEL};

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::config::ArenaConfig;

    static NEXT_ID: AtomicU64 = AtomicU64::new(0);

    /// Per-test unique shared-memory name so parallel tests never collide.
    pub fn unique_shm_name(tag: &str) -> String {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        format!("rc_test_{}_{}_{}", tag, std::process::id(), id)
    }

    /// A small arena suitable for unit tests.
    pub fn small_arena_config(tag: &str) -> ArenaConfig {
        ArenaConfig {
            name: unique_shm_name(tag),
            size_bytes: 8 * 1024 * 1024,
            registry_slots: 64,
        }
    }
}
