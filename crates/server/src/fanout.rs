//! Trainer-side fanout client.
//!
//! Each training step produces rollouts on one host that every inference
//! worker's cache server needs. The updater posts the same `UpdateCache`
//! request to all peers concurrently and waits for all completions;
//! per-peer failures are logged, never retried, and do not fail the batch.

use std::collections::BTreeSet;

use futures::future::join_all;
use regex::Regex;
use rollout_cache_core::prompt_fingerprint;

use crate::api::types::{TokenList, UpdateCacheRequest, UpdateCacheResponse};
use crate::config::DEFAULT_PORT;

/// Environment variable holding the worker host list, formatted as
/// comma-separated `[v6addr]:port` entries.
pub const PEERS_ENV: &str = "ROLLOUT_CACHE_PEERS";

/// Peer used when the environment names none.
pub const DEFAULT_PEER: &str = "localhost:6378";

/// Outcome of one fanout broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Requests × peers attempted.
    pub attempted: usize,
    /// Calls that returned `success = true`.
    pub succeeded: usize,
}

/// Broadcasts rollout uploads to every peer cache server.
pub struct CacheUpdater {
    peers: Vec<String>,
    client: reqwest::Client,
}

impl CacheUpdater {
    /// Peer list from `ROLLOUT_CACHE_PEERS`, falling back to localhost.
    pub fn from_env() -> Self {
        Self::new(peer_addresses(std::env::var(PEERS_ENV).ok().as_deref()))
    }

    pub fn new(peers: Vec<String>) -> Self {
        tracing::info!(?peers, "fanout updater configured");
        Self {
            peers,
            client: reqwest::Client::new(),
        }
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Upload rollout batches: `responses` holds `responses_per_prompt`
    /// consecutive entries per prompt, parallel to `prompts`.
    pub async fn update_response_cache(
        &self,
        prompts: &[Vec<i32>],
        responses: &[Vec<i32>],
        responses_per_prompt: usize,
    ) -> FanoutReport {
        if responses_per_prompt == 0 || responses.len() % responses_per_prompt != 0 {
            tracing::warn!(
                responses = responses.len(),
                responses_per_prompt,
                "response batch shape mismatch, nothing uploaded"
            );
            return FanoutReport::default();
        }

        let num_prompts = responses.len() / responses_per_prompt;
        let mut requests = Vec::with_capacity(num_prompts);
        for i in 0..num_prompts {
            let prompt = &prompts[i * responses_per_prompt];
            let group = &responses[i * responses_per_prompt..(i + 1) * responses_per_prompt];
            requests.push(UpdateCacheRequest {
                prompt_hash: prompt_fingerprint(prompt),
                prompt: prompt.clone().into(),
                responses: group.iter().map(|r| TokenList::from(r.clone())).collect(),
            });
        }
        self.broadcast(requests).await
    }

    /// Upload prompt-only trees ahead of rollout inference, so the very
    /// first decode steps can already speculate against the prompt.
    pub async fn update_prompt_cache(&self, prompts: &[Vec<i32>]) -> FanoutReport {
        let requests = prompts
            .iter()
            .map(|prompt| UpdateCacheRequest {
                prompt_hash: prompt_fingerprint(prompt),
                prompt: prompt.clone().into(),
                responses: Vec::new(),
            })
            .collect();
        self.broadcast(requests).await
    }

    async fn broadcast(&self, requests: Vec<UpdateCacheRequest>) -> FanoutReport {
        let mut calls = Vec::with_capacity(requests.len() * self.peers.len());
        for (request_index, request) in requests.iter().enumerate() {
            for peer in &self.peers {
                let url = format!("http://{peer}/v1/cache/update");
                let client = self.client.clone();
                let request = request.clone();
                let peer = peer.clone();
                calls.push(async move {
                    let outcome = client
                        .post(&url)
                        .json(&request)
                        .send()
                        .await
                        .and_then(|r| r.error_for_status());
                    match outcome {
                        Ok(response) => match response.json::<UpdateCacheResponse>().await {
                            Ok(body) if body.success => true,
                            Ok(_) => {
                                tracing::error!(%peer, request_index, "peer rejected the upload");
                                false
                            }
                            Err(e) => {
                                tracing::error!(%peer, request_index, error = %e, "bad upload response");
                                false
                            }
                        },
                        Err(e) => {
                            tracing::error!(%peer, request_index, error = %e, "upload failed");
                            false
                        }
                    }
                });
            }
        }

        let attempted = calls.len();
        let succeeded = join_all(calls).await.into_iter().filter(|ok| *ok).count();
        FanoutReport {
            attempted,
            succeeded,
        }
    }
}

/// Parse the peer host list: IPv6 hosts in `[addr]:port` form, deduplicated
/// by host (the cache port is fixed fleet-wide, so only the address
/// matters). Falls back to localhost when unset or unparsable.
fn peer_addresses(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return vec![DEFAULT_PEER.to_string()];
    };
    let pattern = Regex::new(r"(?i)\[([0-9a-f:]+)\]:\d+").expect("static regex");
    let hosts: BTreeSet<String> = pattern
        .captures_iter(raw)
        .map(|c| c[1].to_string())
        .collect();
    if hosts.is_empty() {
        return vec![DEFAULT_PEER.to_string()];
    }
    hosts
        .into_iter()
        .map(|host| format!("[{host}]:{DEFAULT_PORT}"))
        .collect()
}
