//! Interleaved weighted round robin.
//!
//! Consultants are ordered by weight descending (stable, so equal weights
//! keep retrieval order). The sequence is then built in rounds: each round
//! visits every consultant once and emits those that still have budget left.
//! Heavier consultants therefore appear earlier and more densely without
//! being grouped into one contiguous block.

use crate::error::{LeadflowError, Result};
use crate::types::ConsultantId;

/// Build one dispatch cycle from a weight snapshot.
///
/// The result has length `sum(weights)` and each consultant appears exactly
/// `weight` times. Fails with `EmptyWeightTable` when no weight is positive.
pub fn build_sequence(weights: &[(ConsultantId, u32)]) -> Result<Vec<ConsultantId>> {
    let mut remaining: Vec<(ConsultantId, u32)> =
        weights.iter().copied().filter(|(_, w)| *w > 0).collect();
    if remaining.is_empty() {
        return Err(LeadflowError::EmptyWeightTable);
    }
    // `sort_by` is stable.
    remaining.sort_by(|a, b| b.1.cmp(&a.1));

    let max_weight = remaining[0].1;
    let total: usize = remaining.iter().map(|(_, w)| *w as usize).sum();
    let mut sequence = Vec::with_capacity(total);

    for _round in 0..max_weight {
        for (id, count) in remaining.iter_mut() {
            if *count > 0 {
                sequence.push(*id);
                *count -= 1;
            }
        }
    }
    Ok(sequence)
}
