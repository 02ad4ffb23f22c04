//! Long→wide reshaper.
//!
//! The indicator cache is long-form: one row per (security, indicator) with
//! period columns. Serving wants wide-form: one row per security with one
//! column per (period, indicator) pair, flattened to `{period}_{indicator}`
//! and ordered most-recent-period-first. Missing cells are dropped during
//! the melt; Numeric and Text values pass through tagged, never coerced.

use crate::models::{CellValue, StockCode};
use crate::storage::IndicatorIndex;
use std::collections::BTreeMap;

/// One melted observation.
#[derive(Debug, Clone, PartialEq)]
pub struct LongTuple {
    pub code: StockCode,
    pub period: String,
    pub indicator: String,
    pub value: CellValue,
}

/// Wide-form indicator table ready for the export join.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WideIndicators {
    /// Flattened `{period}_{indicator}` names, period descending then
    /// indicator ascending.
    pub columns: Vec<String>,
    pub rows: BTreeMap<StockCode, BTreeMap<String, CellValue>>,
}

impl WideIndicators {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Melt the cache into long tuples, dropping Missing cells.
pub fn melt(index: &IndicatorIndex) -> Vec<LongTuple> {
    index
        .values()
        .flat_map(|row| {
            row.values.iter().filter(|(_, v)| !v.is_missing()).map(|(period, value)| {
                LongTuple {
                    code: row.code.clone(),
                    period: period.clone(),
                    indicator: row.indicator.clone(),
                    value: value.clone(),
                }
            })
        })
        .collect()
}

/// Pivot long tuples to one row per security. First value wins on duplicate
/// (security, period, indicator) keys.
pub fn pivot(tuples: Vec<LongTuple>) -> WideIndicators {
    let mut keys: Vec<(String, String)> = Vec::new();
    let mut rows: BTreeMap<StockCode, BTreeMap<String, CellValue>> = BTreeMap::new();

    for t in tuples {
        let column = format!("{}_{}", t.period, t.indicator);
        let row = rows.entry(t.code).or_default();
        if row.contains_key(&column) {
            continue;
        }
        row.insert(column, t.value);
        let key = (t.period, t.indicator);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    // Period descending, indicator ascending within a period.
    keys.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    let columns = keys.into_iter().map(|(p, i)| format!("{}_{}", p, i)).collect();

    WideIndicators { columns, rows }
}

/// Full reshape of the deduplicated indicator cache.
pub fn pivot_indicators(index: &IndicatorIndex) -> WideIndicators {
    pivot(melt(index))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IndicatorRow;
    use crate::scraper::cleaner::normalize_code;

    fn index_from(rows: Vec<IndicatorRow>) -> IndicatorIndex {
        rows.into_iter()
            .map(|r| ((r.code.clone(), r.indicator.clone()), r))
            .collect()
    }

    fn row(c: &str, name: &str, pairs: &[(&str, CellValue)]) -> IndicatorRow {
        IndicatorRow {
            code: normalize_code(c).unwrap(),
            indicator: name.to_string(),
            values: pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    #[test]
    fn test_melt_drops_missing() {
        let index = index_from(vec![row(
            "600000",
            "EPS",
            &[
                ("2023-12-31", CellValue::Numeric(1.2)),
                ("2022-12-31", CellValue::Missing),
            ],
        )]);
        let tuples = melt(&index);
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].period, "2023-12-31");
    }

    #[test]
    fn test_pivot_round_trip() {
        let index = index_from(vec![
            row(
                "600000",
                "EPS",
                &[
                    ("2023-12-31", CellValue::Numeric(1.2)),
                    ("2022-12-31", CellValue::Numeric(1.0)),
                ],
            ),
            row("600000", "ROE", &[("2023-12-31", CellValue::Numeric(10.5))]),
            row("000001", "EPS", &[("2023-12-31", CellValue::Numeric(2.0))]),
        ]);
        let wide = pivot_indicators(&index);

        let sh = wide.rows.get(&normalize_code("600000").unwrap()).unwrap();
        assert_eq!(sh.get("2023-12-31_EPS"), Some(&CellValue::Numeric(1.2)));
        assert_eq!(sh.get("2022-12-31_EPS"), Some(&CellValue::Numeric(1.0)));
        assert_eq!(sh.get("2023-12-31_ROE"), Some(&CellValue::Numeric(10.5)));

        let sz = wide.rows.get(&normalize_code("000001").unwrap()).unwrap();
        assert_eq!(sz.get("2023-12-31_EPS"), Some(&CellValue::Numeric(2.0)));
        // Sparse: no ROE column materialized for 000001
        assert_eq!(sz.get("2023-12-31_ROE"), None);
    }

    #[test]
    fn test_columns_period_desc_then_indicator() {
        let index = index_from(vec![
            row("600000", "ROE", &[("2022-12-31", CellValue::Numeric(9.0))]),
            row(
                "600000",
                "EPS",
                &[
                    ("2022-12-31", CellValue::Numeric(1.0)),
                    ("2023-12-31", CellValue::Numeric(1.2)),
                ],
            ),
        ]);
        let wide = pivot_indicators(&index);
        assert_eq!(
            wide.columns,
            vec!["2023-12-31_EPS", "2022-12-31_EPS", "2022-12-31_ROE"]
        );
    }

    #[test]
    fn test_text_values_preserved() {
        let index = index_from(vec![row(
            "600000",
            "负债率",
            &[("2023-12-31", CellValue::Text("见附注".to_string()))],
        )]);
        let wide = pivot_indicators(&index);
        let row = wide.rows.get(&normalize_code("600000").unwrap()).unwrap();
        assert_eq!(
            row.get("2023-12-31_负债率"),
            Some(&CellValue::Text("见附注".to_string()))
        );
    }

    #[test]
    fn test_empty_cache_is_empty_table() {
        let wide = pivot_indicators(&IndicatorIndex::new());
        assert!(wide.is_empty());
        assert!(wide.columns.is_empty());
    }
}
