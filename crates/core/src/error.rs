use thiserror::Error;

/// Errors surfaced by the rollout cache core.
///
/// Programming errors (sentinel emitted, count invariants violated, walking
/// past an edge end) are deliberately *not* represented here: those are
/// construction bugs and fire assertions instead.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("shared memory: {0}")]
    Shmem(#[from] shared_memory::ShmemError),

    #[error("arena capacity exceeded: requested {requested} bytes, {remaining} remaining")]
    ArenaCapacityExceeded { requested: usize, remaining: usize },

    #[error("registry full: all {slots} slots in use")]
    RegistryFull { slots: usize },

    #[error("arena {name:?} has an incompatible layout (bad magic or version)")]
    LayoutMismatch { name: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
