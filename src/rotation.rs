//! Deterministic daily quest rotation.
//!
//! `(date, serverId)` must map to the same type set across processes and
//! restarts with no shared state, and has to agree with what older module
//! versions already wrote: the seed is an FNV-1a hash of `"{date}#{serverId}"`
//! driving a mulberry32 generator (JS `Math.imul` semantics, i.e. wrapping
//! 32-bit arithmetic) through a Fisher–Yates shuffle.

use crate::config::QuestConfig;
use crate::quest::{QuestType, ALWAYS_TYPES, POOL_TYPES};

/// FNV-1a over the raw bytes, 32-bit.
fn fnv1a(input: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in input.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// mulberry32: tiny seeded PRNG yielding floats in [0, 1).
struct Mulberry32 {
    state: u32,
}

impl Mulberry32 {
    fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> f64 {
        self.state = self.state.wrapping_add(0x6D2B_79F5);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        f64::from(t ^ (t >> 14)) / 4_294_967_296.0
    }
}

/// Today's active quest set: the always-included types plus a seeded
/// fixed-size draw from the pool. Pure; callers may recompute it as a
/// fallback whenever the ActiveTypesRecord is missing.
pub fn select_types(date: &str, server_id: &str, cfg: &QuestConfig) -> Vec<QuestType> {
    let need = cfg.total_daily.saturating_sub(ALWAYS_TYPES.len());
    let mut rng = Mulberry32::new(fnv1a(&format!("{date}#{server_id}")));

    let mut pool: Vec<QuestType> = POOL_TYPES.to_vec();
    for i in (1..pool.len()).rev() {
        let j = (rng.next() * (i as f64 + 1.0)).floor() as usize;
        pool.swap(i, j);
    }

    let mut selected: Vec<QuestType> = ALWAYS_TYPES.to_vec();
    selected.extend(pool.into_iter().take(need.min(POOL_TYPES.len())));
    selected
}
