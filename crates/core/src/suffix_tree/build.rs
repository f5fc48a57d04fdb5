//! Online construction by Ukkonen's algorithm.
//!
//! One phase per appended token position, applying the classic extension
//! rules: create a leaf where the active point has no matching edge
//! (rule 2), stop the phase early when the token is already present on the
//! edge (rule 3 / showstopper), and split the edge on a mid-edge mismatch,
//! suffix-linking each new internal node to the next one created. The
//! walk-down step keeps the active point canonical.
//!
//! Counts are *not* maintained during construction: per-extension
//! increments do not survive edge splits with the subtree-frequency
//! semantics speculation needs, so a single post-order pass recomputes
//! them after every extend.

use crate::arena::SharedArena;
use crate::error::CacheError;

use super::node::NO_NODE;
use super::{SuffixTree, Token, MAX_SEQS, NODE_SIZE, POOL_SLACK};

impl SuffixTree {
    /// Append `tokens` as sequence `seq_id` and fold every suffix of the
    /// result into the tree.
    ///
    /// The node pool is allocated lazily on the first call, sized to
    /// `2·n + 30` nodes for the anticipated final stream (a suffix tree
    /// over `n` tokens has at most `2n − 1` nodes). Each sequence accepts
    /// exactly one `extend`; the rollout upload path concatenates
    /// everything it has into one call.
    pub fn extend(
        &mut self,
        arena: &SharedArena,
        seq_id: u32,
        tokens: &[Token],
    ) -> Result<(), CacheError> {
        if tokens.is_empty() {
            return Ok(());
        }
        if seq_id as usize >= MAX_SEQS {
            return Err(CacheError::InvalidInput(format!(
                "seq_id {seq_id} out of range (max {MAX_SEQS})"
            )));
        }
        if self.header().seqs[seq_id as usize].off != 0 {
            return Err(CacheError::InvalidInput(format!(
                "sequence {seq_id} already extended"
            )));
        }

        let n = tokens.len() as u64;
        if self.header().pool_off == 0 {
            let cap = 2 * n + POOL_SLACK;
            let pool_off = arena.allocate((cap * NODE_SIZE) as usize)?;
            {
                let header = self.header_mut();
                header.pool_off = pool_off;
                header.pool_cap = cap;
            }
            let root = self.alloc_node();
            self.node_mut(root).suffix_link = root;
            self.header_mut().root = root;
        } else if self.header().pool_cap - self.header().pool_used < 2 * n + 1 {
            return Err(CacheError::InvalidInput(format!(
                "node pool sized for the initial extend cannot absorb {n} more tokens"
            )));
        }

        let seq_off = arena.allocate(tokens.len() * std::mem::size_of::<Token>())?;
        // SAFETY: the buffer was just allocated with room for all tokens.
        unsafe {
            std::ptr::copy_nonoverlapping(
                tokens.as_ptr(),
                arena.address_of(seq_off) as *mut Token,
                tokens.len(),
            );
        }
        {
            let root = self.header().root;
            let header = self.header_mut();
            let slot = &mut header.seqs[seq_id as usize];
            slot.off = seq_off;
            slot.len = tokens.len() as u32;
            let state = &mut header.states[seq_id as usize];
            state.active_node = root;
            state.active_edge = -1;
            state.active_length = 0;
            state.remaining_suffixes = 0;
        }

        for pos in 0..tokens.len() {
            self.extend_phase(seq_id, pos as i32);
        }
        self.fix_counts();
        Ok(())
    }

    /// One Ukkonen phase: insert every suffix of `seq[0..=pos]` not yet
    /// present.
    fn extend_phase(&mut self, seq_id: u32, pos: i32) {
        let root = self.header().root;
        let current = self.seq(seq_id)[pos as usize];
        let mut state = self.header().states[seq_id as usize];
        let mut last_new = NO_NODE;
        state.remaining_suffixes += 1;

        while state.remaining_suffixes > 0 {
            if state.active_length == 0 {
                state.active_edge = pos;
            }
            let search = if state.active_length == 0 {
                current
            } else {
                self.seq(seq_id)[state.active_edge as usize]
            };

            match self.find_child(state.active_node, search) {
                None => {
                    // Rule 2: no edge for this token at the active point.
                    let leaf = self.new_leaf(seq_id, pos, state.active_node);
                    self.set_child(state.active_node, leaf);
                    if last_new != NO_NODE {
                        self.node_mut(last_new).suffix_link = state.active_node;
                        last_new = NO_NODE;
                    }
                }
                Some(child) => {
                    let edge_len = self.build_edge_length(child, seq_id, pos);
                    if state.active_length >= edge_len {
                        // Walk-down: hop over the whole edge and retry.
                        state.active_edge += edge_len;
                        state.active_length -= edge_len;
                        state.active_node = child;
                        continue;
                    }

                    let child_node = *self.node(child);
                    let edge_pos = child_node.start as usize + state.active_length as usize;
                    let edge_token = self.seq(child_node.seq_id)[edge_pos];

                    if edge_token == current {
                        // Rule 3: already present; this phase is done.
                        state.active_length += 1;
                        if last_new != NO_NODE && state.active_node != root {
                            self.node_mut(last_new).suffix_link = state.active_node;
                            last_new = NO_NODE;
                        }
                        break;
                    }

                    // Mid-edge mismatch: split and hang a new leaf off the
                    // split node.
                    let split = self.split_edge(child, state.active_length);
                    let leaf = self.new_leaf(seq_id, pos, split);
                    self.set_child(split, leaf);
                    if last_new != NO_NODE {
                        self.node_mut(last_new).suffix_link = split;
                    }
                    last_new = split;
                }
            }

            state.remaining_suffixes -= 1;
            if state.active_node == root && state.active_length > 0 {
                state.active_length -= 1;
                state.active_edge = pos - state.remaining_suffixes + 1;
            } else if state.active_node != root {
                let link = self.node(state.active_node).suffix_link;
                state.active_node = if link != NO_NODE { link } else { root };
            }
        }

        if last_new != NO_NODE {
            self.node_mut(last_new).suffix_link = root;
        }
        self.header_mut().states[seq_id as usize] = state;
    }

    /// Edge length during construction, relative to the phase position.
    /// An open leaf of the sequence being extended reaches `pos`; an open
    /// leaf of a foreign sequence reaches that sequence's end.
    fn build_edge_length(&self, node_off: u64, seq_id: u32, pos: i32) -> i32 {
        if node_off == self.header().root {
            return 0;
        }
        let n = self.node(node_off);
        if n.length == -1 {
            if n.seq_id == seq_id {
                pos - n.start as i32 + 1
            } else {
                self.header().seqs[n.seq_id as usize].len as i32 - n.start as i32
            }
        } else {
            n.length
        }
    }

    fn new_leaf(&mut self, seq_id: u32, start: i32, parent: u64) -> u64 {
        let leaf = self.alloc_node();
        let node = self.node_mut(leaf);
        node.parent = parent;
        node.seq_id = seq_id;
        node.start = start as u32;
        node.length = -1;
        node.count = 1;
        leaf
    }

    /// Split the edge into `node_off` at `split_pos` label tokens, leaving
    /// a new internal node in its place with the original node below it.
    fn split_edge(&mut self, node_off: u64, split_pos: i32) -> u64 {
        let original = *self.node(node_off);
        let split = self.alloc_node();
        {
            let s = self.node_mut(split);
            s.parent = original.parent;
            s.seq_id = original.seq_id;
            s.start = original.start;
            s.length = split_pos;
        }
        // The split node keeps the original first token, so this replaces
        // the original in its parent's child list.
        if original.parent != NO_NODE {
            self.set_child(original.parent, split);
        }
        {
            let n = self.node_mut(node_off);
            n.parent = split;
            n.start += split_pos as u32;
            if n.length != -1 {
                n.length -= split_pos;
            }
        }
        self.set_child(split, node_off);
        split
    }

    /// Recompute subtree-frequency counts: leaves hold 1, internal nodes
    /// the sum of their children. Iterative post-order; a degenerate
    /// path-shaped tree is as deep as the stream is long.
    fn fix_counts(&mut self) {
        let root = self.header().root;
        if root == NO_NODE {
            return;
        }
        let mut order = Vec::with_capacity(self.header().pool_used as usize);
        let mut stack = vec![root];
        while let Some(off) = stack.pop() {
            order.push(off);
            let mut child = self.node(off).first_child;
            while child != NO_NODE {
                stack.push(child);
                child = self.node(child).next_sibling;
            }
        }
        // Preorder reversed visits every child before its parent.
        for &off in order.iter().rev() {
            let count = if self.node(off).is_leaf() {
                1
            } else {
                let mut sum = 0u32;
                let mut child = self.node(off).first_child;
                while child != NO_NODE {
                    sum += self.node(child).count;
                    child = self.node(child).next_sibling;
                }
                sum
            };
            self.node_mut(off).count = count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::small_arena_config;
    use crate::SENTINEL;

    fn build(tag: &str, tokens: &[Token]) -> (SharedArena, SuffixTree) {
        let arena = SharedArena::create(&small_arena_config(tag)).unwrap();
        let mut tree = SuffixTree::create(&arena).unwrap();
        tree.extend(&arena, 0, tokens).unwrap();
        (arena, tree)
    }

    /// Walk `needle` from the root, character by character. Returns true
    /// if the whole needle is spelled by concatenated edge labels.
    fn walk(tree: &SuffixTree, needle: &[Token]) -> bool {
        tree.match_pattern(needle, 0).is_some()
    }

    #[test]
    fn every_suffix_is_locatable() {
        let s = [1, 2, 3, SENTINEL, 1, 2, 3, 4, 5, SENTINEL, 1, 2, 4, SENTINEL];
        let (_arena, tree) = build("build_suffixes", &s);
        for i in 0..s.len() {
            assert!(walk(&tree, &s[i..]), "suffix at {i} not found");
        }
    }

    #[test]
    fn absent_substrings_are_not_found() {
        let (_arena, tree) = build("build_absent", &[1, 2, 3, 4, SENTINEL]);
        assert!(!walk(&tree, &[2, 4]));
        assert!(!walk(&tree, &[5]));
        assert!(!walk(&tree, &[4, SENTINEL, 1]));
    }

    #[test]
    fn counts_are_structural() {
        // Verify count = 1 for leaves and count = sum(children) everywhere.
        let s = [7, 8, 7, 8, 7, SENTINEL];
        let (_arena, tree) = build("build_counts", &s);
        let mut stack = vec![tree.header().root];
        while let Some(off) = stack.pop() {
            let node = tree.node(off);
            if node.is_leaf() {
                assert_eq!(node.count, 1, "leaf count at offset {off}");
            } else {
                let mut sum = 0;
                let mut child = node.first_child;
                while child != NO_NODE {
                    sum += tree.node(child).count;
                    stack.push(child);
                    child = tree.node(child).next_sibling;
                }
                assert_eq!(node.count, sum, "internal count at offset {off}");
            }
        }
    }

    #[test]
    fn root_count_equals_suffix_count() {
        // Every suffix of the stream ends somewhere below the root, so the
        // root's count is the stream length.
        let s = [1, 2, 1, 2, 3, SENTINEL];
        let (_arena, tree) = build("build_root_count", &s);
        assert_eq!(tree.node(tree.header().root).count, s.len() as u32);
    }

    #[test]
    fn repeated_tokens_build_a_path() {
        let (_arena, tree) = build("build_runs", &[5, 5, 5, 5, 5]);
        for k in 1..=5 {
            assert!(walk(&tree, &vec![5; k]));
        }
        assert!(!walk(&tree, &vec![5; 6]));
    }

    #[test]
    fn random_streams_keep_invariants() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for round in 0..8 {
            let len = rng.gen_range(8..120);
            let mut s: Vec<Token> = (0..len).map(|_| rng.gen_range(1..12)).collect();
            s.push(SENTINEL);
            let (_arena, tree) = build(&format!("build_rand_{round}"), &s);
            for i in 0..s.len() {
                assert!(walk(&tree, &s[i..]), "round {round}: suffix {i} missing");
            }
            assert_eq!(tree.node(tree.header().root).count, s.len() as u32);
        }
    }

    #[test]
    fn two_sequences_share_one_tree() {
        let arena = SharedArena::create(&small_arena_config("build_multi_seq")).unwrap();
        let mut tree = SuffixTree::create(&arena).unwrap();
        let seq0: Vec<Token> = vec![1, 2, 3, 4, 5, SENTINEL];
        let seq1: Vec<Token> = vec![9, 2, 3, SENTINEL];
        tree.extend(&arena, 0, &seq0).unwrap();
        tree.extend(&arena, 1, &seq1).unwrap();
        assert_eq!(tree.num_seqs(), 2);

        for i in 0..seq0.len() {
            assert!(walk(&tree, &seq0[i..]), "seq0 suffix at {i} not found");
        }
        for i in 0..seq1.len() {
            assert!(walk(&tree, &seq1[i..]), "seq1 suffix at {i} not found");
        }
        // The shared infix forces a split of a seq0-owned edge while seq1
        // is being folded in.
        assert!(walk(&tree, &[2, 3, SENTINEL]));
        assert!(!walk(&tree, &[9, 5]));
        assert!(!walk(&tree, &[2, 3, 9]));
    }

    #[test]
    fn multi_sequence_counts_stay_structural() {
        let arena = SharedArena::create(&small_arena_config("build_multi_counts")).unwrap();
        let mut tree = SuffixTree::create(&arena).unwrap();
        tree.extend(&arena, 0, &[7, 8, 7, SENTINEL]).unwrap();
        tree.extend(&arena, 1, &[8, 7, SENTINEL]).unwrap();
        let mut stack = vec![tree.header().root];
        while let Some(off) = stack.pop() {
            let node = *tree.node(off);
            if node.is_leaf() {
                assert_eq!(node.count, 1, "leaf count at offset {off}");
            } else {
                let mut sum = 0;
                let mut child = node.first_child;
                while child != NO_NODE {
                    sum += tree.node(child).count;
                    stack.push(child);
                    child = tree.node(child).next_sibling;
                }
                assert_eq!(node.count, sum, "internal count at offset {off}");
            }
        }
    }

    #[test]
    fn foreign_sequence_leaf_edges_end_at_their_own_sequence() {
        // A leaf created while extending seq 0 keeps its label anchored in
        // seq 0. Once seq 1 is folded in, both construction and queries
        // must measure such an edge against seq 0's length; an off-by-one
        // here silently truncates or overruns every cross-sequence walk.
        let arena = SharedArena::create(&small_arena_config("build_foreign_edges")).unwrap();
        let mut tree = SuffixTree::create(&arena).unwrap();
        let seqs: [Vec<Token>; 2] = [vec![1, 2, 3, 4, 5, SENTINEL], vec![9, 2, 3, SENTINEL]];
        tree.extend(&arena, 0, &seqs[0]).unwrap();
        tree.extend(&arena, 1, &seqs[1]).unwrap();

        let mut seen = [false; 2];
        let mut stack = vec![tree.header().root];
        while let Some(off) = stack.pop() {
            let node = *tree.node(off);
            if node.length == -1 {
                seen[node.seq_id as usize] = true;
                assert_eq!(
                    tree.query_edge_length(off),
                    seqs[node.seq_id as usize].len() as i32 - node.start as i32,
                    "open leaf at offset {off}"
                );
            }
            let mut child = node.first_child;
            while child != NO_NODE {
                stack.push(child);
                child = tree.node(child).next_sibling;
            }
        }
        assert!(seen[0] && seen[1], "expected open leaves from both sequences");
    }

    #[test]
    fn pool_usage_stays_within_bound() {
        let s: Vec<Token> = (0..200).map(|i| i % 7).collect();
        let (_arena, tree) = build("build_pool_bound", &s);
        let header = tree.header();
        assert!(header.pool_used <= 2 * s.len() as u64 + 1);
        assert!(header.pool_used <= header.pool_cap);
    }

    #[test]
    fn second_extend_of_same_sequence_is_rejected() {
        let arena = SharedArena::create(&small_arena_config("build_one_shot")).unwrap();
        let mut tree = SuffixTree::create(&arena).unwrap();
        tree.extend(&arena, 0, &[1, 2, 3]).unwrap();
        assert!(tree.extend(&arena, 0, &[4, 5]).is_err());
    }

    #[test]
    fn out_of_range_seq_id_is_rejected() {
        let arena = SharedArena::create(&small_arena_config("build_seq_range")).unwrap();
        let mut tree = SuffixTree::create(&arena).unwrap();
        assert!(tree.extend(&arena, MAX_SEQS as u32, &[1]).is_err());
    }

    #[test]
    fn empty_extend_is_a_noop() {
        let arena = SharedArena::create(&small_arena_config("build_empty")).unwrap();
        let mut tree = SuffixTree::create(&arena).unwrap();
        tree.extend(&arena, 0, &[]).unwrap();
        assert_eq!(tree.num_seqs(), 0);
    }
}
