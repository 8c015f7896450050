//! The three challenge algorithms: two time-based waits and one
//! proof-of-work search, kept close to the teacher's original
//! implementation and generalized to support cooperative cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize, Clone)]
pub struct AnubisChallengeRules {
    #[serde(default)]
    pub difficulty: usize,
    #[serde(default)]
    pub algorithm: String,
}

/// Handles both the pre-Aug-2025 wire format (`challenge` is a bare hex
/// string) and the current one (`challenge` is `{id, randomData}`).
#[derive(Debug, Clone)]
pub struct ChallengeData {
    pub id: Option<String>,
    pub random_data: String,
}

impl<'de> Deserialize<'de> for ChallengeData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, MapAccess, Visitor};
        use std::fmt;

        struct ChallengeDataVisitor;

        impl<'de> Visitor<'de> for ChallengeDataVisitor {
            type Value = ChallengeData;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string or an object with id and randomData")
            }

            fn visit_str<E>(self, value: &str) -> Result<ChallengeData, E>
            where
                E: de::Error,
            {
                Ok(ChallengeData { id: None, random_data: value.to_string() })
            }

            fn visit_map<M>(self, mut map: M) -> Result<ChallengeData, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut id: Option<String> = None;
                let mut random_data: Option<String> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "id" => id = Some(map.next_value()?),
                        "randomData" => random_data = Some(map.next_value()?),
                        _ => {
                            let _ = map.next_value::<serde::de::IgnoredAny>()?;
                        }
                    }
                }

                let random_data = random_data.ok_or_else(|| de::Error::missing_field("randomData"))?;
                Ok(ChallengeData { id, random_data })
            }
        }

        deserializer.deserialize_any(ChallengeDataVisitor)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnubisChallenge {
    pub challenge: ChallengeData,
    pub rules: AnubisChallengeRules,
}

#[derive(Debug, Serialize, Clone)]
pub struct SolverResult {
    pub hash: String,
    pub data: String,
    pub difficulty: usize,
    pub nonce: Option<u64>,
}

impl AnubisChallenge {
    /// Effective algorithm, defaulting to `fast` when the field is absent
    /// (older Anubis deployments omitted it).
    pub fn algorithm(&self) -> &str {
        if self.rules.algorithm.is_empty() {
            "fast"
        } else {
            &self.rules.algorithm
        }
    }

    /// Minimum enforced wait for the time-based algorithms: a small fixed
    /// buffer on top of `difficulty * 80ms`/`difficulty * 800ms`, so a
    /// submission is never sent a hair before the server's own timing gate
    /// elapses.
    ///
    /// `fast`/`slow` have no time-based wait (the PoW search itself is the
    /// wait). Every other tag -- `preact`, the explicit `unknown` tag, and
    /// any future/unrecognized tag -- falls back to the `preact` wait.
    pub fn min_wait(&self) -> Option<Duration> {
        match self.algorithm() {
            "fast" | "slow" => None,
            "metarefresh" => Some(Duration::from_millis((self.rules.difficulty as u64) * 800) + WAIT_BUFFER),
            _ => Some(Duration::from_millis((self.rules.difficulty as u64) * 80) + WAIT_BUFFER),
        }
    }
}

/// Small fixed buffer added on top of the difficulty-scaled wait for
/// `preact`/`metarefresh` (and anything falling back to `preact`).
const WAIT_BUFFER: Duration = Duration::from_millis(50);

/// `preact`: `hash = SHA-256-hex(randomData)`.
pub fn solve_preact(challenge: &AnubisChallenge) -> SolverResult {
    let hash = Sha256::digest(challenge.challenge.random_data.as_bytes());
    SolverResult {
        hash: hex::encode(hash),
        data: challenge.challenge.random_data.clone(),
        difficulty: challenge.rules.difficulty,
        nonce: None,
    }
}

/// `metarefresh`: identity — the hash submitted is the raw random data.
pub fn solve_metarefresh(challenge: &AnubisChallenge) -> SolverResult {
    SolverResult {
        hash: challenge.challenge.random_data.clone(),
        data: challenge.challenge.random_data.clone(),
        difficulty: challenge.rules.difficulty,
        nonce: None,
    }
}

fn check_difficulty(hash: &[u8], difficulty: usize) -> bool {
    let full_bytes = difficulty / 2;
    if hash.len() < full_bytes {
        return false;
    }
    if hash[..full_bytes].iter().any(|&byte| byte != 0) {
        return false;
    }
    if difficulty % 2 != 0 {
        if hash.len() <= full_bytes {
            return false;
        }
        if (hash[full_bytes] >> 4) != 0 {
            return false;
        }
    }
    true
}

/// How often (in per-thread iterations) the PoW loop checks for
/// cancellation. spec.md §5 requires at least every 4096 attempts.
const CANCEL_POLL_INTERVAL: u64 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum PowError {
    #[error("cancelled")]
    Cancelled,
    #[error("proof-of-work search finished without a solution")]
    NoSolution,
}

/// `fast`/`slow`: brute-force search for a nonce whose
/// `SHA-256-hex(randomData‖nonce)` has `difficulty` leading hex zeroes.
/// Polls `cancel` at least every [`CANCEL_POLL_INTERVAL`] attempts per
/// worker thread and aborts promptly when it fires.
pub fn solve_pow(challenge: &AnubisChallenge, cancel: &CancellationToken) -> Result<SolverResult, PowError> {
    let num_threads = rayon::current_num_threads().max(1);
    let difficulty = challenge.rules.difficulty;
    let data_bytes = challenge.challenge.random_data.as_bytes();
    let initial_capacity = data_bytes.len() + 20;

    let found = Arc::new(AtomicBool::new(false));
    let cancelled = Arc::new(AtomicBool::new(false));
    let winning_nonce = Arc::new(AtomicU64::new(0));

    let result = (0..num_threads)
        .into_par_iter()
        .map(|thread_id| {
            let mut nonce = thread_id as u64;
            let mut hasher = Sha256::new();
            let mut buffer = Vec::with_capacity(initial_capacity);
            buffer.extend_from_slice(data_bytes);
            let data_len = data_bytes.len();
            let mut itoa_buf = itoa::Buffer::new();
            let mut checked = 0u64;

            while !found.load(Ordering::Relaxed) {
                checked += 1;
                if checked % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
                    cancelled.store(true, Ordering::SeqCst);
                    return None;
                }

                let nonce_str_bytes = itoa_buf.format(nonce).as_bytes();
                buffer.truncate(data_len);
                buffer.extend_from_slice(nonce_str_bytes);

                hasher.update(&buffer);
                let hash_result = hasher.finalize_reset();

                if check_difficulty(&hash_result, difficulty) {
                    if !found.swap(true, Ordering::SeqCst) {
                        winning_nonce.store(nonce, Ordering::Relaxed);
                        return Some(SolverResult {
                            hash: hex::encode(hash_result),
                            data: challenge.challenge.random_data.clone(),
                            difficulty,
                            nonce: Some(nonce),
                        });
                    }
                    return None;
                }

                match nonce.checked_add(num_threads as u64) {
                    Some(next) => nonce = next,
                    None => break,
                }
            }
            None
        })
        .find_any(|res| res.is_some())
        .flatten();

    if cancelled.load(Ordering::Relaxed) && result.is_none() {
        return Err(PowError::Cancelled);
    }

    match result {
        Some(res) => Ok(res),
        None => {
            if found.load(Ordering::Relaxed) {
                let nonce = winning_nonce.load(Ordering::Relaxed);
                let mut buffer = Vec::with_capacity(initial_capacity);
                buffer.extend_from_slice(data_bytes);
                let data_len = data_bytes.len();
                let mut itoa_buf = itoa::Buffer::new();
                buffer.truncate(data_len);
                buffer.extend_from_slice(itoa_buf.format(nonce).as_bytes());
                let hash_result = Sha256::digest(&buffer);
                Ok(SolverResult {
                    hash: hex::encode(hash_result),
                    data: challenge.challenge.random_data.clone(),
                    difficulty,
                    nonce: Some(nonce),
                })
            } else {
                Err(PowError::NoSolution)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(algorithm: &str, difficulty: usize, random_data: &str) -> AnubisChallenge {
        AnubisChallenge {
            challenge: ChallengeData { id: Some("X".into()), random_data: random_data.into() },
            rules: AnubisChallengeRules { difficulty, algorithm: algorithm.into() },
        }
    }

    #[test]
    fn preact_hashes_random_data() {
        let c = challenge("preact", 0, "R");
        let result = solve_preact(&c);
        assert_eq!(result.hash, crate::util::sha256_hex("R"));
    }

    #[test]
    fn metarefresh_echoes_random_data() {
        let c = challenge("metarefresh", 3, "R");
        let result = solve_metarefresh(&c);
        assert_eq!(result.hash, "R");
    }

    #[test]
    fn pow_finds_valid_nonce() {
        let c = challenge("fast", 2, "test-data");
        let token = CancellationToken::new();
        let result = solve_pow(&c, &token).unwrap();
        let expected = crate::util::sha256_hex(&format!("test-data{}", result.nonce.unwrap()));
        assert_eq!(result.hash, expected);
        assert!(result.hash.starts_with("00"));
    }

    #[test]
    fn pow_respects_cancellation() {
        // A difficulty this high will not be found before we cancel.
        let c = challenge("slow", 64, "unsolvable-in-practice");
        let token = CancellationToken::new();
        token.cancel();
        let result = solve_pow(&c, &token);
        assert!(matches!(result, Err(PowError::Cancelled)));
    }

    #[test]
    fn algorithm_defaults_to_fast_when_empty() {
        let c = challenge("", 1, "R");
        assert_eq!(c.algorithm(), "fast");
    }

    #[test]
    fn min_wait_matches_table() {
        assert_eq!(challenge("preact", 2, "r").min_wait(), Some(Duration::from_millis(160) + WAIT_BUFFER));
        assert_eq!(challenge("metarefresh", 2, "r").min_wait(), Some(Duration::from_millis(1600) + WAIT_BUFFER));
        assert_eq!(challenge("fast", 2, "r").min_wait(), None);
        assert_eq!(challenge("slow", 2, "r").min_wait(), None);
    }

    #[test]
    fn unknown_and_unrecognized_algorithms_fall_back_to_preact_wait() {
        let expected = Some(Duration::from_millis(160) + WAIT_BUFFER);
        assert_eq!(challenge("unknown", 2, "r").min_wait(), expected);
        assert_eq!(challenge("some-future-tag", 2, "r").min_wait(), expected);
    }
}
