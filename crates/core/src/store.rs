//! Owner-side rollout store: upload assembly and registry swaps.
//!
//! An upload carries a prompt fingerprint, the prompt tokens, and the
//! response token vectors of one rollout batch. The store concatenates
//! them into a single sentinel-separated stream, builds a suffix tree over
//! it in the arena (outside the lock, on memory nobody else can see), and
//! atomically swaps the tree into the registry. The superseded tree, if
//! any, is destroyed after the lock is released.

use crate::arena::SharedArena;
use crate::config::{ArenaConfig, SpeculationConfig};
use crate::error::CacheError;
use crate::suffix_tree::{SuffixTree, Token, SENTINEL};

/// Counters reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Live trees in the registry.
    pub trees: usize,
    /// Bump-allocator high-water mark in bytes.
    pub arena_used_bytes: u64,
    /// Total arena size in bytes.
    pub arena_capacity_bytes: u64,
}

/// The arena owner's interface: create the region, accept uploads, evict.
pub struct RolloutStore {
    arena: SharedArena,
    spec: SpeculationConfig,
}

impl RolloutStore {
    /// Create the shared-memory region and an empty registry.
    pub fn create(arena: &ArenaConfig, spec: SpeculationConfig) -> Result<Self, CacheError> {
        spec.validate()?;
        Ok(Self {
            arena: SharedArena::create(arena)?,
            spec,
        })
    }

    /// The underlying arena (readers attach by name, tests peek at usage).
    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    /// Install the rollout for `fingerprint`, replacing any previous tree.
    ///
    /// An empty prompt is short-circuited to success without touching the
    /// registry. Arena or registry exhaustion leaves the registry unchanged
    /// (no partial install).
    pub fn upload(
        &self,
        fingerprint: u64,
        prompt: &[Token],
        responses: &[Vec<Token>],
    ) -> Result<(), CacheError> {
        if prompt.is_empty() {
            tracing::debug!(fingerprint, "upload with empty prompt ignored");
            return Ok(());
        }

        let stream = assemble_stream(prompt, responses, self.spec.prefix_reinjection);
        let mut tree = SuffixTree::create(&self.arena)?;
        if let Err(e) = tree.extend(&self.arena, 0, &stream) {
            tree.destroy(&self.arena);
            return Err(e);
        }

        let inserted = {
            let guard = self.arena.lock();
            self.arena.registry().insert(&guard, fingerprint, tree.offset())
        };
        let superseded = match inserted {
            Ok(old) => old,
            Err(e) => {
                tree.destroy(&self.arena);
                return Err(e);
            }
        };
        if let Some(old_off) = superseded {
            SuffixTree::open(self.arena.base(), old_off).destroy(&self.arena);
        }

        tracing::debug!(
            fingerprint,
            stream_len = stream.len(),
            responses = responses.len(),
            replaced = superseded.is_some(),
            "rollout uploaded"
        );
        Ok(())
    }

    /// Drop the tree for `fingerprint`. Returns whether one existed.
    pub fn evict(&self, fingerprint: u64) -> bool {
        let removed = {
            let guard = self.arena.lock();
            self.arena.registry().remove(&guard, fingerprint)
        };
        match removed {
            Some(off) => {
                SuffixTree::open(self.arena.base(), off).destroy(&self.arena);
                tracing::debug!(fingerprint, "tree evicted");
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> StoreStats {
        let guard = self.arena.lock();
        StoreStats {
            trees: self.arena.registry().len(&guard),
            arena_used_bytes: self.arena.used_bytes(),
            arena_capacity_bytes: self.arena.capacity_bytes(),
        }
    }
}

impl Drop for RolloutStore {
    fn drop(&mut self) {
        // Destroy every registered tree before the region is unlinked so
        // teardown mirrors construction. The region disappears with the
        // arena either way; this keeps destroy accounting symmetric.
        let offsets = {
            let guard = self.arena.lock();
            let mut v = Vec::new();
            self.arena.registry().for_each(&guard, |_, off| v.push(off));
            v
        };
        for off in offsets {
            SuffixTree::open(self.arena.base(), off).destroy(&self.arena);
        }
    }
}

/// Concatenate a rollout into the stream the tree is built over:
/// `P ++ [-1] ++ tail(P) ++ R_0 ++ [-1] ++ tail(P) ++ R_1 ++ [-1] ++ …`
/// where `tail(P)` is the last `prefix_reinjection` prompt tokens.
/// Re-injecting the prompt tail before each response keeps patterns that
/// straddle the prompt/response boundary matchable.
pub(crate) fn assemble_stream(
    prompt: &[Token],
    responses: &[Vec<Token>],
    prefix_reinjection: usize,
) -> Vec<Token> {
    let tail_len = prompt.len().min(prefix_reinjection);
    let tail = &prompt[prompt.len() - tail_len..];
    let total = prompt.len()
        + 1
        + responses
            .iter()
            .map(|r| tail_len + r.len() + 1)
            .sum::<usize>();
    let mut stream = Vec::with_capacity(total);
    stream.extend_from_slice(prompt);
    stream.push(SENTINEL);
    for response in responses {
        stream.extend_from_slice(tail);
        stream.extend_from_slice(response);
        stream.push(SENTINEL);
    }
    stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::small_arena_config;

    fn store(tag: &str) -> RolloutStore {
        RolloutStore::create(&small_arena_config(tag), SpeculationConfig::default()).unwrap()
    }

    #[test]
    fn stream_assembly_reinjects_prompt_tail() {
        let s = assemble_stream(&[1, 2, 3, 4, 5, 6, 7], &[vec![10, 11], vec![12]], 5);
        assert_eq!(
            s,
            vec![
                1, 2, 3, 4, 5, 6, 7, SENTINEL, //
                3, 4, 5, 6, 7, 10, 11, SENTINEL, //
                3, 4, 5, 6, 7, 12, SENTINEL,
            ]
        );
    }

    #[test]
    fn stream_assembly_short_prompt_reinjects_everything() {
        let s = assemble_stream(&[8, 9], &[vec![1]], 5);
        assert_eq!(s, vec![8, 9, SENTINEL, 8, 9, 1, SENTINEL]);
    }

    #[test]
    fn stream_assembly_without_responses() {
        let s = assemble_stream(&[5, 6, 7], &[], 5);
        assert_eq!(s, vec![5, 6, 7, SENTINEL]);
    }

    #[test]
    fn upload_registers_one_tree() {
        let store = store("store_upload");
        store.upload(42, &[1, 2, 3], &[vec![4, 5]]).unwrap();
        assert_eq!(store.stats().trees, 1);
    }

    #[test]
    fn empty_prompt_is_short_circuited() {
        let store = store("store_empty_prompt");
        store.upload(42, &[], &[vec![4, 5]]).unwrap();
        assert_eq!(store.stats().trees, 0);
    }

    #[test]
    fn reupload_replaces_and_frees_the_old_tree() {
        let store = store("store_replace");
        store.upload(42, &[1, 2, 3], &[vec![4, 4, 4]]).unwrap();
        // The replacement is built before its predecessor is destroyed, so
        // the second upload still grows the arena; from the third one on,
        // every same-shape tree must fit entirely in freed blocks.
        store.upload(42, &[1, 2, 3], &[vec![9, 9, 9]]).unwrap();
        let high_water = store.arena().used_bytes();
        store.upload(42, &[1, 2, 3], &[vec![5, 5, 5]]).unwrap();
        assert_eq!(store.arena().used_bytes(), high_water);
        assert_eq!(store.stats().trees, 1);
    }

    #[test]
    fn distinct_fingerprints_coexist() {
        let store = store("store_distinct");
        store.upload(1, &[1, 2, 3], &[vec![4]]).unwrap();
        store.upload(2, &[7, 8, 9], &[vec![10]]).unwrap();
        assert_eq!(store.stats().trees, 2);
    }

    #[test]
    fn evict_removes_the_tree() {
        let store = store("store_evict");
        store.upload(42, &[1, 2, 3], &[vec![4]]).unwrap();
        assert!(store.evict(42));
        assert_eq!(store.stats().trees, 0);
        assert!(!store.evict(42));
    }

    #[test]
    fn capacity_exhaustion_leaves_registry_unchanged() {
        let store = RolloutStore::create(
            &crate::config::ArenaConfig {
                name: crate::test_util::unique_shm_name("store_full"),
                size_bytes: 2 * 1024 * 1024,
                registry_slots: 16,
            },
            SpeculationConfig::default(),
        )
        .unwrap();
        store.upload(1, &[1, 2, 3], &[vec![4, 5]]).unwrap();
        // A rollout far bigger than the region must fail cleanly.
        let huge: Vec<Token> = (0..2_000_000).map(|i| (i % 50_000) as Token).collect();
        let err = store.upload(2, &huge, &[]).unwrap_err();
        assert!(matches!(err, CacheError::ArenaCapacityExceeded { .. }));
        assert_eq!(store.stats().trees, 1);
    }
}
