//! Filter gates: steps whose output is a subsequence of their input.

use salesflow_core::lead::LeadScoringResult;

/// Keep the items matching `predicate`, in their original order.
///
/// Items are cloned as-is; the output is never longer than the input.
pub fn retain<T: Clone>(items: &[T], predicate: impl Fn(&T) -> bool) -> Vec<T> {
    items.iter().filter(|item| predicate(item)).cloned().collect()
}

/// Leads scoring strictly above `threshold`.
pub fn above_threshold(scores: &[LeadScoringResult], threshold: u8) -> Vec<LeadScoringResult> {
    retain(scores, |result| result.score() > threshold)
}
