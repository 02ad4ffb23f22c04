//! Incremental work-set planner.
//!
//! The work-set is pure set-difference: every security in the target
//! universe that the cache has no row for yet, in the universe's original
//! order, capped at the per-run budget. Nothing is persisted about what was
//! deferred; the next run recomputes the set from the cache and picks up
//! where coverage left off.

use crate::models::StockCode;
use std::collections::BTreeSet;

/// `target − cached`, order-preserving, capped at `limit`.
pub fn plan(target: &[StockCode], cached: &BTreeSet<StockCode>, limit: usize) -> Vec<StockCode> {
    target
        .iter()
        .filter(|code| !cached.contains(code))
        .take(limit)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::cleaner::normalize_code;

    fn codes(list: &[&str]) -> Vec<StockCode> {
        list.iter().map(|s| normalize_code(s).unwrap()).collect()
    }

    #[test]
    fn test_plan_is_set_difference_in_target_order() {
        let target = codes(&["600000", "000001", "300750", "000002"]);
        let cached: BTreeSet<StockCode> = codes(&["000001"]).into_iter().collect();
        let todo = plan(&target, &cached, usize::MAX);
        assert_eq!(todo, codes(&["600000", "300750", "000002"]));
    }

    #[test]
    fn test_plan_caps_at_limit() {
        let target = codes(&["600000", "000001", "300750"]);
        let cached = BTreeSet::new();
        assert_eq!(plan(&target, &cached, 2), codes(&["600000", "000001"]));
        assert_eq!(plan(&target, &cached, 0).len(), 0);
        // Cap never pads: len == min(len(todo), limit)
        assert_eq!(plan(&target, &cached, 10).len(), 3);
    }

    #[test]
    fn test_plan_fully_cached_is_empty() {
        let target = codes(&["600000", "000001"]);
        let cached: BTreeSet<StockCode> = target.iter().cloned().collect();
        assert!(plan(&target, &cached, 100).is_empty());
    }
}
