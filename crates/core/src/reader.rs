//! Worker-side reader cache.
//!
//! Each inference worker holds one [`SuffixCacheReader`]: an attachment to
//! the shared arena plus a per-request view of (tree, speculation length).
//! Requests are attached in batches when first seen, speculated against on
//! every decode step, and evicted when they finish.
//!
//! # Reader contract
//!
//! [`SuffixCacheReader::attach_batch`] caches a raw tree pointer read from
//! the registry under the arena lock. An upload for the same fingerprint
//! destroys that tree, so a cached pointer must never be used across an
//! upload boundary for its fingerprint: re-attach at safe points (when a
//! request is first seen, or after [`SuffixCacheReader::evict`]), and do
//! not upload for a fingerprint while a request carrying it is in flight.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::arena::SharedArena;
use crate::config::SpeculationConfig;
use crate::error::CacheError;
use crate::fingerprint::prompt_fingerprint;
use crate::suffix_tree::{SpecParams, SpecResult, SuffixTree, Token};

struct RequestContext {
    /// Tree published for this request's prompt, or `None` on a registry
    /// miss (speculation then returns empty until re-attach).
    tree: Option<SuffixTree>,
    /// Adaptive speculation length, bounded by the config.
    spec_len: usize,
}

/// Per-worker view of the rollout cache.
pub struct SuffixCacheReader {
    arena: SharedArena,
    config: SpeculationConfig,
    requests: HashMap<String, RequestContext>,
}

impl SuffixCacheReader {
    /// Attach to the arena named `shm_name` with default speculation
    /// settings.
    pub fn open(shm_name: &str) -> Result<Self, CacheError> {
        Self::with_config(shm_name, SpeculationConfig::default())
    }

    /// Attach with explicit speculation settings.
    pub fn with_config(shm_name: &str, config: SpeculationConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self {
            arena: SharedArena::open(shm_name)?,
            config,
            requests: HashMap::new(),
        })
    }

    /// Resolve trees for a batch of requests.
    ///
    /// Requests already known to this reader are untouched. For each new
    /// request the prompt is fingerprinted, the registry is consulted once
    /// under the arena lock, and the speculation length starts at
    /// `spec_start_len`. A length mismatch between the two slices is a
    /// boundary error: logged, nothing attached.
    pub fn attach_batch(&mut self, req_ids: &[String], prompts: &[Vec<Token>]) {
        if req_ids.len() != prompts.len() {
            tracing::warn!(
                req_ids = req_ids.len(),
                prompts = prompts.len(),
                "attach_batch length mismatch"
            );
            return;
        }

        let missing: Vec<(usize, u64)> = req_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| !self.requests.contains_key(*id))
            .map(|(i, _)| (i, prompt_fingerprint(&prompts[i])))
            .collect();
        if missing.is_empty() {
            return;
        }

        let guard = self.arena.lock();
        let registry = self.arena.registry();
        let base = self.arena.base();
        for (i, fingerprint) in missing {
            let tree = registry
                .get(&guard, fingerprint)
                .map(|off| SuffixTree::open(base, off));
            if tree.is_none() {
                tracing::debug!(req_id = %req_ids[i], fingerprint, "no tree for prompt");
            }
            self.requests.insert(
                req_ids[i].clone(),
                RequestContext {
                    tree,
                    spec_len: self.config.spec_start_len,
                },
            );
        }
    }

    /// [`SuffixCacheReader::speculate_batch`] with the configured defaults:
    /// path mode at the config's probability floor.
    pub fn speculate_batch_with_defaults(
        &self,
        req_ids: &[String],
        patterns: &[Vec<Token>],
    ) -> Vec<Vec<Token>> {
        self.speculate_batch(req_ids, patterns, self.config.min_token_prob, false)
    }

    /// Speculate continuations for a batch of requests, in parallel.
    ///
    /// Entries are independent and the trees are read-only once published,
    /// so the batch fans out across the rayon pool. Unknown requests,
    /// registry misses, and empty patterns all yield empty continuations.
    pub fn speculate_batch(
        &self,
        req_ids: &[String],
        patterns: &[Vec<Token>],
        min_token_prob: f32,
        use_tree: bool,
    ) -> Vec<Vec<Token>> {
        self.speculate_batch_results(req_ids, patterns, min_token_prob, use_tree)
            .into_iter()
            .map(|r| r.token_ids)
            .collect()
    }

    /// Like [`SuffixCacheReader::speculate_batch`] but returns the full
    /// candidates. Tree-mode callers need the parent links to drive
    /// tree-style verification.
    pub fn speculate_batch_results(
        &self,
        req_ids: &[String],
        patterns: &[Vec<Token>],
        min_token_prob: f32,
        use_tree: bool,
    ) -> Vec<SpecResult> {
        if req_ids.len() != patterns.len() {
            tracing::warn!(
                req_ids = req_ids.len(),
                patterns = patterns.len(),
                "speculate_batch length mismatch"
            );
            return vec![SpecResult::default(); req_ids.len()];
        }

        req_ids
            .par_iter()
            .zip(patterns.par_iter())
            .map(|(req_id, pattern)| {
                if pattern.is_empty() {
                    return SpecResult::default();
                }
                let Some(ctx) = self.requests.get(req_id) else {
                    return SpecResult::default();
                };
                let Some(tree) = &ctx.tree else {
                    return SpecResult::default();
                };
                let params = SpecParams {
                    max_spec_tokens: ctx.spec_len,
                    min_token_prob,
                    use_tree,
                    min_match_len: self.config.min_match_len,
                };
                tree.speculate(pattern, &params)
            })
            .collect()
    }

    /// Feed back how many speculated tokens the verifier accepted.
    ///
    /// Multiplicative increase / multiplicative decrease: doubling while
    /// the tree keeps paying out past the current length, halving as soon
    /// as it does not, clamped to `[spec_start_len, spec_max_len]`.
    pub fn update_spec_len(&mut self, req_id: &str, valid_len: usize) {
        let Some(ctx) = self.requests.get_mut(req_id) else {
            tracing::warn!(req_id, "update_spec_len for unknown request");
            return;
        };
        ctx.spec_len = if valid_len > ctx.spec_len {
            (ctx.spec_len * 2).min(self.config.spec_max_len)
        } else {
            (ctx.spec_len / 2).max(self.config.spec_start_len)
        };
    }

    /// Current speculation length for a request, if attached.
    pub fn spec_len(&self, req_id: &str) -> Option<usize> {
        self.requests.get(req_id).map(|c| c.spec_len)
    }

    /// Forget a request entirely (tree pointer and speculation length).
    pub fn evict(&mut self, req_id: &str) {
        self.requests.remove(req_id);
    }

    /// Number of requests this reader currently tracks.
    pub fn num_requests(&self) -> usize {
        self.requests.len()
    }
}
