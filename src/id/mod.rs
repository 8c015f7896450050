//! Snowflake-style 64-bit unique ID generator.
//!
//! Layout (from the high bit down): 1 unused sign bit, 41 bits of
//! milliseconds since [`EPOCH_MS`], 10 bits of node id (0..=1023), 12 bits
//! of per-millisecond sequence. IDs are always positive, non-zero, and
//! strictly increasing within a single generator instance.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// 2024-01-01T00:00:00Z in epoch milliseconds.
const EPOCH_MS: i64 = 1_704_067_200_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_NODE: i64 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdGenError {
    #[error("node id {0} out of range 0..=1023")]
    InvalidNode(i64),
}

struct SequenceState {
    last_ms: i64,
    sequence: i64,
}

/// A single generator instance. Safe to share across threads via `Arc`, or
/// to use through the process-wide singleton in [`init`]/[`next_id`].
pub struct IdGenerator {
    node: i64,
    state: Mutex<SequenceState>,
}

impl IdGenerator {
    /// Builds a generator bound to `node`. Fails if `node` is outside
    /// `0..=1023`.
    pub fn new(node: i64) -> Result<Self, IdGenError> {
        if !(0..=MAX_NODE).contains(&node) {
            return Err(IdGenError::InvalidNode(node));
        }
        Ok(Self {
            node,
            state: Mutex::new(SequenceState { last_ms: -1, sequence: 0 }),
        })
    }

    /// Produces the next monotonic ID, blocking until the next millisecond
    /// boundary if the per-millisecond sequence space is exhausted.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut now = current_millis();

        if now < state.last_ms {
            // Clock moved backwards; stall until it catches back up rather
            // than risk emitting a duplicate or decreasing ID.
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                now = wait_next_millis(state.last_ms);
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let ts = now - EPOCH_MS;
        ((ts << (NODE_BITS + SEQUENCE_BITS)) | (self.node << SEQUENCE_BITS) | state.sequence)
            .max(1)
    }

    pub fn node(&self) -> i64 {
        self.node
    }
}

fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn wait_next_millis(last_ms: i64) -> i64 {
    let mut now = current_millis();
    while now <= last_ms {
        std::thread::yield_now();
        now = current_millis();
    }
    now
}

/// Decomposes an ID produced by [`IdGenerator`] back into its parts, mostly
/// useful for debugging and tests; callers should otherwise treat IDs as
/// opaque per spec.
pub fn decode(id: i64) -> (i64, i64, i64) {
    let sequence = id & MAX_SEQUENCE;
    let node = (id >> SEQUENCE_BITS) & MAX_NODE;
    let ts = (id >> (NODE_BITS + SEQUENCE_BITS)) + EPOCH_MS;
    (ts, node, sequence)
}

static GLOBAL: std::sync::OnceLock<IdGenerator> = std::sync::OnceLock::new();

/// Initializes the process-wide generator. Intended to be called at most
/// once at startup; if called again, the latest call wins (subsequent
/// `next_id` calls through the global helper will use whichever generator
/// was installed last, per spec.md's documented contract).
pub fn init(node: i64) -> Result<(), IdGenError> {
    let gen = IdGenerator::new(node)?;
    // OnceLock can only be set once; model "later calls win" by swapping in
    // a fresh cell behind a mutex-free pointer would need unsafe, so instead
    // we keep a secondary mutex-guarded slot callers go through.
    if GLOBAL.set(gen).is_err() {
        let mut guard = LATEST.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(IdGenerator::new(node)?);
    }
    Ok(())
}

static LATEST: Mutex<Option<IdGenerator>> = Mutex::new(None);

/// Returns the next ID from the process-wide generator. Falls back to a
/// node-0 generator, lazily installed, if `init` was never called — callers
/// (and tests) that only ever run a single node don't need to call `init`
/// just to get an ID.
pub fn next_id() -> i64 {
    let mut guard = LATEST.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(gen) = guard.as_ref() {
        return gen.next_id();
    }
    drop(guard);
    GLOBAL.get_or_init(|| IdGenerator::new(0).expect("node 0 is always valid")).next_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rejects_out_of_range_node() {
        assert!(IdGenerator::new(-1).is_err());
        assert!(IdGenerator::new(1024).is_err());
        assert!(IdGenerator::new(0).is_ok());
        assert!(IdGenerator::new(1023).is_ok());
    }

    #[test]
    fn ids_are_positive_and_monotonic() {
        let gen = IdGenerator::new(5).unwrap();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > 0);
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn ids_are_monotonic_under_concurrency() {
        let gen = Arc::new(IdGenerator::new(7).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gen = gen.clone();
            handles.push(thread::spawn(move || {
                (0..2000).map(|_| gen.next_id()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let unique_count = {
            let mut sorted = all.clone();
            sorted.sort_unstable();
            sorted.dedup();
            sorted.len()
        };
        assert_eq!(unique_count, all.len(), "no two calls may return the same id");
        all.sort_unstable();
        assert!(all.iter().all(|&id| id > 0));
    }

    #[test]
    fn decode_roundtrips_node() {
        let gen = IdGenerator::new(42).unwrap();
        let id = gen.next_id();
        let (_, node, _) = decode(id);
        assert_eq!(node, 42);
    }
}
