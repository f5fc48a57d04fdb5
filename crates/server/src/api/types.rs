//! Wire types for the cache RPC surface.
//!
//! `UpdateCacheRequest` is the compatibility-bearing layout shared with
//! every peer server and trainer client; field names must not change.

use serde::{Deserialize, Serialize};

/// A vector of token IDs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenList {
    pub tokens: Vec<i32>,
}

impl From<Vec<i32>> for TokenList {
    fn from(tokens: Vec<i32>) -> Self {
        Self { tokens }
    }
}

/// One rollout upload: fingerprint, prompt, and the sampled responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateCacheRequest {
    pub prompt_hash: u64,
    pub prompt: TokenList,
    #[serde(default)]
    pub responses: Vec<TokenList>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateCacheResponse {
    pub success: bool,
}

/// Explicit removal of a fingerprint's tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvictCacheRequest {
    pub prompt_hash: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvictCacheResponse {
    pub success: bool,
}

/// Liveness and capacity snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
    pub trees: usize,
    pub arena_used_bytes: u64,
    pub arena_capacity_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_request_wire_shape() {
        let req = UpdateCacheRequest {
            prompt_hash: 42,
            prompt: vec![1, 2, 3].into(),
            responses: vec![vec![4, 5].into(), vec![6].into()],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "prompt_hash": 42,
                "prompt": {"tokens": [1, 2, 3]},
                "responses": [{"tokens": [4, 5]}, {"tokens": [6]}],
            })
        );
    }

    #[test]
    fn update_request_roundtrip() {
        let req = UpdateCacheRequest {
            prompt_hash: u64::MAX,
            prompt: vec![-1, 0, i32::MAX].into(),
            responses: vec![],
        };
        let back: UpdateCacheRequest =
            serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn responses_field_is_optional() {
        // Prompt-only uploads omit the responses array entirely.
        let req: UpdateCacheRequest =
            serde_json::from_str(r#"{"prompt_hash": 7, "prompt": {"tokens": [1]}}"#).unwrap();
        assert!(req.responses.is_empty());
    }
}
