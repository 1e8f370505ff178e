use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub identity_id: Uuid,
    pub rank: u32,
    pub tests_passed: u32,
    pub tests_total: u32,
    pub elapsed_seconds: u64,
}

/// One submitted participant's result, in submission-arrival order.
#[derive(Debug, Clone)]
pub struct RankInput {
    pub identity_id: Uuid,
    pub tests_passed: u32,
    pub tests_total: u32,
    pub elapsed_seconds: u64,
}

/// Orders submitted participants: tests passed descending, elapsed time
/// ascending, residual ties by submission arrival (the input order).
/// Ranks are 1-based positions in that ordering.
///
/// Derived data only. Recomputed fresh on every call, never stored.
pub fn rank(mut inputs: Vec<RankInput>) -> Vec<LeaderboardEntry> {
    inputs.sort_by(|a, b| {
        b.tests_passed
            .cmp(&a.tests_passed)
            .then(a.elapsed_seconds.cmp(&b.elapsed_seconds))
    });
    inputs
        .into_iter()
        .enumerate()
        .map(|(i, e)| LeaderboardEntry {
            identity_id: e.identity_id,
            rank: i as u32 + 1,
            tests_passed: e.tests_passed,
            tests_total: e.tests_total,
            elapsed_seconds: e.elapsed_seconds,
        })
        .collect()
}

/// Convenience for the ack path: the caller's 1-based rank.
pub fn rank_of(entries: &[LeaderboardEntry], identity_id: Uuid) -> Option<u32> {
    entries
        .iter()
        .find(|e| e.identity_id == identity_id)
        .map(|e| e.rank)
}
