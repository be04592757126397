use std::collections::HashSet;

use grantscout_core::{Opportunity, ScoredOpportunity, MAX_SCORE, MIN_SCORE};
use tracing::warn;

#[derive(Debug, Hash, PartialEq, Eq)]
enum GroupKey {
    Url(String),
    Title(String),
}

/// Local stand-in for the enrichment stage: one item per URL, or per exact
/// title when no URL is known. First occurrence wins and input order is kept.
/// Items carrying neither are passed through untouched.
pub fn fallback_dedup(items: Vec<Opportunity>) -> Vec<Opportunity> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let key = match item.url_key() {
                Some(url) => GroupKey::Url(url.to_string()),
                None if !item.title.is_empty() => GroupKey::Title(item.title.clone()),
                None => return true,
            };
            seen.insert(key)
        })
        .collect()
}

/// Consecutive slices of at most `size` items; a zero size is treated as one.
pub fn batches(items: &[Opportunity], size: usize) -> std::slice::Chunks<'_, Opportunity> {
    items.chunks(size.max(1))
}

/// Tolerance when comparing a reported total against the weighted formula.
pub const TOTAL_TOLERANCE: f64 = 0.05;

/// Drops scored items with any score outside `[0, 10]`. Totals that disagree
/// with the weights are kept as reported. Returns the kept items and the
/// number discarded.
pub fn validate_scores(scored: Vec<ScoredOpportunity>) -> (Vec<ScoredOpportunity>, usize) {
    let before = scored.len();
    let kept: Vec<ScoredOpportunity> = scored
        .into_iter()
        .filter(|item| {
            if !item.scores_in_range() {
                warn!(
                    title = %item.opportunity.title,
                    total = item.total_score,
                    "discarding scored item outside {MIN_SCORE}..={MAX_SCORE}"
                );
                return false;
            }
            if !item.total_matches_weights(TOTAL_TOLERANCE) {
                warn!(
                    title = %item.opportunity.title,
                    reported = item.total_score,
                    expected = item.weighted_total(),
                    "total score deviates from weighted sub-scores"
                );
            }
            true
        })
        .collect();
    let discarded = before - kept.len();
    (kept, discarded)
}
