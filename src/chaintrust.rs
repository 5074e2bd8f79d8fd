//! Accumulated chain trust and the fork-cursor selection rule.

use primitive_types::U256;

use crate::index::BlockIndex;

pub type ChainTrust = U256;

/// Outcome of weighing a newly indexed block against the current fork tip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComparisonResult {
    PreferCurrent,
    PreferCandidate,
}

/// A candidate displaces the tip only on strictly greater trust. An exact
/// tie goes to the candidate only when both tips were minted the same way
/// by the same producer, which makes the switch an in-place replacement
/// rather than a competing reorg.
pub fn compare(candidate: &BlockIndex, current: &BlockIndex) -> ComparisonResult {
    if candidate.trust > current.trust
        || (candidate.trust == current.trust && candidate.is_equivalent(current))
    {
        ComparisonResult::PreferCandidate
    } else {
        ComparisonResult::PreferCurrent
    }
}
