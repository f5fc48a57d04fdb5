//! Pattern matching and continuation speculation.
//!
//! Speculation walks the deepest matchable suffix of the recent token
//! window onto the tree, then extends it with either a single best-child
//! path or a probability-pruned candidate tree. Continuation weights come
//! from subtree frequencies; separators never count: a child whose edge
//! starts with the sentinel is skipped and excluded from the probability
//! denominator, so weights reflect real continuations only.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::node::NO_NODE;
use super::{SuffixTree, Token, SENTINEL};

/// Parameters for one speculation call.
#[derive(Debug, Clone)]
pub struct SpecParams {
    /// Maximum tokens to emit.
    pub max_spec_tokens: usize,
    /// Probability floor; continuations below it are cut.
    pub min_token_prob: f32,
    /// Emit a pruned candidate tree instead of a single path.
    pub use_tree: bool,
    /// Minimum pattern-suffix length allowed to match.
    pub min_match_len: usize,
}

impl Default for SpecParams {
    fn default() -> Self {
        Self {
            max_spec_tokens: 16,
            min_token_prob: 0.1,
            use_tree: false,
            min_match_len: 3,
        }
    }
}

/// A speculated continuation.
///
/// `token_ids`, `parents`, and `probs` are parallel: `parents[k]` is the
/// index of token `k`'s predecessor in the candidate (−1 for roots), which
/// makes the result directly usable for tree-style speculative decoding.
/// In path mode the parents are simply `[-1, 0, 1, ...]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecResult {
    pub token_ids: Vec<Token>,
    pub parents: Vec<i32>,
    pub probs: Vec<f32>,
    /// Sum of all emitted probabilities.
    pub score: f32,
    /// Pattern tokens consumed by the winning match.
    pub match_len: i32,
}

impl SpecResult {
    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    fn push(&mut self, token: Token, parent: i32, prob: f32) {
        self.token_ids.push(token);
        self.parents.push(parent);
        self.probs.push(prob);
        self.score += prob;
    }
}

/// Frontier entry for tree-mode speculation, ordered by probability.
struct FrontierItem {
    prob: f32,
    node: u64,
    edge_idx: i32,
    parent: i32,
}

impl PartialEq for FrontierItem {
    fn eq(&self, other: &Self) -> bool {
        self.prob == other.prob
    }
}

impl Eq for FrontierItem {}

impl PartialOrd for FrontierItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prob.total_cmp(&other.prob)
    }
}

impl SuffixTree {
    /// Speculate a continuation of `pattern`.
    ///
    /// Starting with the longest suffix of the pattern and shrinking down
    /// to `min_match_len` tokens, each suffix is walked from the root; the
    /// first one that yields a candidate with non-zero score wins and is
    /// returned immediately. An empty result means nothing matched.
    pub fn speculate(&self, pattern: &[Token], params: &SpecParams) -> SpecResult {
        let min_match = params.min_match_len.max(1);
        if self.header().root == NO_NODE
            || pattern.len() < min_match
            || params.max_spec_tokens == 0
        {
            return SpecResult::default();
        }
        for start_idx in 0..=pattern.len() - min_match {
            let Some((node, edge_idx)) = self.match_pattern(pattern, start_idx) else {
                continue;
            };
            let mut candidate = if params.use_tree {
                self.speculate_tree(node, edge_idx, params)
            } else {
                self.speculate_path(node, edge_idx, params)
            };
            if candidate.score > 0.0 {
                candidate.match_len = (pattern.len() - start_idx) as i32;
                return candidate;
            }
        }
        SpecResult::default()
    }

    /// Walk `pattern[start_idx..]` from the root. On success returns the
    /// deepest node reached and how far along its incoming edge the match
    /// ended.
    pub(crate) fn match_pattern(&self, pattern: &[Token], start_idx: usize) -> Option<(u64, i32)> {
        let root = self.header().root;
        let mut node = root;
        let mut edge_idx: i32 = 0;

        for &token in &pattern[start_idx..] {
            loop {
                if node == root {
                    node = self.find_child(node, token)?;
                    edge_idx = 0;
                    break;
                }
                if edge_idx >= self.query_edge_length(node) {
                    node = self.find_child(node, token)?;
                    edge_idx = 0;
                    continue;
                }
                break;
            }
            let n = self.node(node);
            let label_token = self.seq(n.seq_id)[n.start as usize + edge_idx as usize];
            if label_token != token {
                return None;
            }
            edge_idx += 1;
        }
        Some((node, edge_idx))
    }

    /// Path mode: follow the highest-count child at every branch, emitting
    /// edge tokens along the way. Stops at the token budget, at a sentinel
    /// (not emitted), below the probability floor, or at a dead end.
    fn speculate_path(&self, mut node: u64, mut edge_idx: i32, params: &SpecParams) -> SpecResult {
        let mut result = SpecResult::default();
        let mut prob = 1.0f32;
        while result.token_ids.len() < params.max_spec_tokens && prob >= params.min_token_prob {
            if edge_idx < self.query_edge_length(node) {
                let n = self.node(node);
                let token = self.seq(n.seq_id)[n.start as usize + edge_idx as usize];
                if token == SENTINEL {
                    break;
                }
                let parent = result.token_ids.len() as i32 - 1;
                result.push(token, parent, prob);
                edge_idx += 1;
            } else {
                let Some((best, best_count, total)) = self.best_child(node) else {
                    break;
                };
                prob *= best_count as f32 / total as f32;
                node = best;
                edge_idx = 0;
            }
        }
        result
    }

    /// Tree mode: best-first expansion of a candidate token tree, keyed by
    /// running probability. Inside an edge the token is emitted and the
    /// advanced position re-enters the frontier at unchanged probability;
    /// at an edge end every non-sentinel child joins the frontier at
    /// `prob · count / total` unless it falls below the floor.
    fn speculate_tree(&self, node: u64, edge_idx: i32, params: &SpecParams) -> SpecResult {
        let mut result = SpecResult::default();
        let mut frontier = BinaryHeap::new();
        frontier.push(FrontierItem {
            prob: 1.0,
            node,
            edge_idx,
            parent: -1,
        });

        while result.token_ids.len() < params.max_spec_tokens {
            let Some(item) = frontier.pop() else {
                break;
            };
            if item.edge_idx < self.query_edge_length(item.node) {
                let n = self.node(item.node);
                let token = self.seq(n.seq_id)[n.start as usize + item.edge_idx as usize];
                if token == SENTINEL {
                    // The candidate path ends at the separator.
                    continue;
                }
                result.push(token, item.parent, item.prob);
                frontier.push(FrontierItem {
                    prob: item.prob,
                    node: item.node,
                    edge_idx: item.edge_idx + 1,
                    parent: result.token_ids.len() as i32 - 1,
                });
            } else {
                let Some(total) = self.continuation_weight(item.node) else {
                    continue;
                };
                let mut child = self.node(item.node).first_child;
                while child != NO_NODE {
                    let n = self.node(child);
                    if self.edge_first_token(n) != SENTINEL {
                        let prob = item.prob * n.count as f32 / total as f32;
                        if prob >= params.min_token_prob {
                            frontier.push(FrontierItem {
                                prob,
                                node: child,
                                edge_idx: 0,
                                parent: item.parent,
                            });
                        }
                    }
                    child = n.next_sibling;
                }
            }
        }
        result
    }

    /// Highest-count non-sentinel child of `node`, with the sentinel-free
    /// total used as the probability denominator. Ties keep the first
    /// (smallest-token) child.
    fn best_child(&self, node_off: u64) -> Option<(u64, u32, u32)> {
        let mut best = NO_NODE;
        let mut best_count = 0u32;
        let mut total = 0u32;
        let mut child = self.node(node_off).first_child;
        while child != NO_NODE {
            let n = self.node(child);
            if self.edge_first_token(n) != SENTINEL {
                total += n.count;
                if n.count > best_count {
                    best = child;
                    best_count = n.count;
                }
            }
            child = n.next_sibling;
        }
        if best == NO_NODE {
            None
        } else {
            Some((best, best_count, total))
        }
    }

    /// Sum of non-sentinel child counts, or `None` when the node has no
    /// real continuation.
    fn continuation_weight(&self, node_off: u64) -> Option<u32> {
        let mut total = 0u32;
        let mut child = self.node(node_off).first_child;
        while child != NO_NODE {
            let n = self.node(child);
            if self.edge_first_token(n) != SENTINEL {
                total += n.count;
            }
            child = n.next_sibling;
        }
        (total > 0).then_some(total)
    }
}
