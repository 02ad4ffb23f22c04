use crate::models::{CellValue, IndicatorRow, RawKlineBar, RawQuote, StockCode};
use anyhow::{Context, Result};
use scraper::{Html, Selector};
use tracing::debug;

// ── Indicator rule table ──────────────────────────────────────────────────────

/// Ordered (row-label keyword, short name) rules. A statement row is taken
/// for an indicator when its label contains the keyword and none of the
/// excluded qualifiers; the first surviving row in table order wins.
pub const INDICATOR_RULES: &[(&str, &str)] = &[
    ("基本每股收益", "EPS"),
    ("每股净资产", "BVPS"),
    ("每股经营活动", "OCFPS"),
    ("净资产收益率", "ROE"),
    ("销售净利率", "净利率"),
    ("销售毛利率", "毛利率"),
    ("营业总收入", "营收"),
    ("净利润", "净利"),
    ("扣非净利润", "扣非净利"),
    ("资产负债率", "负债率"),
    ("流动比率", "流动比"),
    ("速动比率", "速动比"),
    ("存货周转率", "存货周转"),
    ("应收账款周转率", "应收周转"),
];

/// Labels carrying these qualifiers are derived growth metrics, not the raw
/// indicator, and must never match.
pub const EXCLUDED_QUALIFIERS: &[&str] = &["增长率", "同比"];

/// Row labels whose presence marks a table as the financial-indicator table.
const ANCHOR_KEYWORDS: &[&str] = &["每股收益", "净资产收益率"];

/// Periods kept per fetch (the page serves a sliding window; older periods
/// accumulate in the cache across runs).
pub const PERIODS_KEPT: usize = 8;

/// First row label containing `keyword`, skipping labels that carry an
/// excluded qualifier.
pub fn match_indicator_label(labels: &[String], keyword: &str) -> Option<usize> {
    labels.iter().position(|l| {
        l.contains(keyword) && !EXCLUDED_QUALIFIERS.iter().any(|q| l.contains(q))
    })
}

// ── Statement page extraction ─────────────────────────────────────────────────

/// Extract indicator rows from a financial-statement HTML page.
///
/// Walks every `<table>`, settles on the first one whose label column hits an
/// anchor keyword, promotes a date-looking first row to the column header,
/// prunes unnamed columns, keeps the `PERIODS_KEPT` most recent periods, and
/// matches rows against `INDICATOR_RULES`.
///
/// `None` means "no data for this security" — absent anchor table and zero
/// matched indicators are both expected outcomes, not errors.
pub fn extract_indicators(html: &str, code: &StockCode) -> Option<Vec<IndicatorRow>> {
    let doc = Html::parse_document(html);
    let table_sel = Selector::parse("table").ok()?;
    let tr_sel = Selector::parse("tr").ok()?;
    let cell_sel = Selector::parse("th, td").ok()?;

    for table in doc.select(&table_sel) {
        let grid: Vec<Vec<String>> = table
            .select(&tr_sel)
            .map(|tr| {
                tr.select(&cell_sel)
                    .map(|c| c.text().collect::<String>().trim().to_string())
                    .collect()
            })
            .filter(|row: &Vec<String>| !row.is_empty())
            .collect();

        let width = grid.iter().map(|r| r.len()).max().unwrap_or(0);
        if width < 2 {
            continue;
        }

        let has_anchor = grid.iter().any(|row| {
            row.first()
                .map(|label| ANCHOR_KEYWORDS.iter().any(|k| label.contains(k)))
                .unwrap_or(false)
        });
        if !has_anchor {
            continue;
        }

        // First candidate table wins, matched or not — mirrors the upstream
        // page layout where exactly one guideline table exists.
        return extract_from_grid(&grid, width, code);
    }

    debug!("{}: no anchor table in document", code);
    None
}

fn extract_from_grid(
    grid: &[Vec<String>],
    width: usize,
    code: &StockCode,
) -> Option<Vec<IndicatorRow>> {
    let cell = |row: &[String], i: usize| row.get(i).cloned().unwrap_or_default();

    // Period header promotion: the first data row is the date row when any of
    // its value cells contains a hyphen or a 20xx year token.
    let first_values: Vec<String> = (1..width).map(|i| cell(&grid[0], i)).collect();
    let promote = first_values.iter().any(|v| v.contains('-') || v.contains("20"));

    let (headers, body): (Vec<String>, &[Vec<String>]) = if promote {
        (first_values, &grid[1..])
    } else {
        ((1..width).map(|i| i.to_string()).collect(), grid)
    };

    // Drop unnamed columns, order most-recent-first, cap the window.
    let mut columns: Vec<(String, usize)> = headers
        .into_iter()
        .enumerate()
        .filter(|(_, h)| !h.is_empty() && !h.eq_ignore_ascii_case("nan"))
        .map(|(i, h)| (h, i + 1))
        .collect();
    columns.sort_by(|a, b| b.0.cmp(&a.0));
    columns.truncate(PERIODS_KEPT);

    let labels: Vec<String> = body.iter().map(|row| cell(row, 0)).collect();

    let mut rows = Vec::new();
    for (keyword, short_name) in INDICATOR_RULES {
        let Some(idx) = match_indicator_label(&labels, keyword) else { continue };
        let values = columns
            .iter()
            .map(|(period, col)| (period.clone(), CellValue::classify(&cell(&body[idx], *col))))
            .collect();
        rows.push(IndicatorRow {
            code: code.clone(),
            indicator: short_name.to_string(),
            values,
        });
    }

    if rows.is_empty() {
        debug!("{}: anchor table matched no indicators", code);
        None
    } else {
        Some(rows)
    }
}

// ── JSON payloads ─────────────────────────────────────────────────────────────

/// Parse one page of the quote listing. `null`/`[]` bodies signal the end of
/// pagination and come back as an empty vec.
pub fn parse_quotes(body: &str) -> Result<Vec<RawQuote>> {
    let body = body.trim();
    if body.is_empty() || body == "null" || body == "[]" {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).context("quote listing payload")
}

/// Parse the daily k-line payload.
pub fn parse_kline(body: &str) -> Result<Vec<RawKlineBar>> {
    let body = body.trim();
    if body.is_empty() || body == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).context("k-line payload")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::cleaner::normalize_code;

    fn statement_page(rows: &str) -> String {
        format!("<html><body><table>{}</table></body></html>", rows)
    }

    fn code() -> StockCode {
        normalize_code("600000").unwrap()
    }

    #[test]
    fn test_no_anchor_table_is_no_data() {
        let html = statement_page(
            "<tr><td>营业收入</td><td>2023-12-31</td></tr>\
             <tr><td>其他</td><td>1.0</td></tr>",
        );
        assert!(extract_indicators(&html, &code()).is_none());
    }

    #[test]
    fn test_excluded_qualifier_is_skipped() {
        let html = statement_page(
            "<tr><td>指标</td><td>2023-12-31</td><td>2022-12-31</td></tr>\
             <tr><td>基本每股收益增长率(%)</td><td>5.0</td><td>4.0</td></tr>\
             <tr><td>基本每股收益(元)</td><td>1.23</td><td>1.10</td></tr>\
             <tr><td>净资产收益率(%)</td><td>10.5</td><td>9.8</td></tr>",
        );
        let rows = extract_indicators(&html, &code()).unwrap();
        let eps = rows.iter().find(|r| r.indicator == "EPS").unwrap();
        assert_eq!(eps.values.get("2023-12-31"), Some(&CellValue::Numeric(1.23)));
        assert_eq!(eps.values.get("2022-12-31"), Some(&CellValue::Numeric(1.10)));
    }

    #[test]
    fn test_qualified_only_label_never_matches() {
        let labels = vec![
            "净利润同比(%)".to_string(),
            "净利润增长率".to_string(),
        ];
        assert_eq!(match_indicator_label(&labels, "净利润"), None);
        let labels = vec!["净利润同比(%)".to_string(), "净利润(元)".to_string()];
        assert_eq!(match_indicator_label(&labels, "净利润"), Some(1));
    }

    #[test]
    fn test_period_window_capped_and_descending() {
        let mut header = String::from("<tr><td>指标</td>");
        let mut data = String::from("<tr><td>净资产收益率(%)</td>");
        for y in 2014..=2023 {
            header.push_str(&format!("<td>{}-12-31</td>", y));
            data.push_str(&format!("<td>{}.0</td>", y - 2000));
        }
        header.push_str("</tr>");
        data.push_str("</tr>");
        let html = statement_page(&format!("{}{}", header, data));

        let rows = extract_indicators(&html, &code()).unwrap();
        let roe = &rows[0];
        assert_eq!(roe.indicator, "ROE");
        assert_eq!(roe.values.len(), PERIODS_KEPT);
        // Most recent 8 of the 10 offered periods survive
        assert!(roe.values.contains_key("2023-12-31"));
        assert!(roe.values.contains_key("2016-12-31"));
        assert!(!roe.values.contains_key("2015-12-31"));
        assert!(!roe.values.contains_key("2014-12-31"));
    }

    #[test]
    fn test_unnamed_columns_dropped() {
        let html = statement_page(
            "<tr><td>指标</td><td>2023-12-31</td><td></td></tr>\
             <tr><td>基本每股收益(元)</td><td>1.23</td><td>9.99</td></tr>",
        );
        let rows = extract_indicators(&html, &code()).unwrap();
        assert_eq!(rows[0].values.len(), 1);
        assert_eq!(rows[0].values.get("2023-12-31"), Some(&CellValue::Numeric(1.23)));
    }

    #[test]
    fn test_missing_and_text_cells_classified() {
        let html = statement_page(
            "<tr><td>指标</td><td>2023-12-31</td><td>2022-12-31</td></tr>\
             <tr><td>资产负债率(%)</td><td>-</td><td>见附注</td></tr>",
        );
        let rows = extract_indicators(&html, &code()).unwrap();
        let row = &rows[0];
        assert_eq!(row.indicator, "负债率");
        assert_eq!(row.values.get("2023-12-31"), Some(&CellValue::Missing));
        assert_eq!(
            row.values.get("2022-12-31"),
            Some(&CellValue::Text("见附注".to_string()))
        );
    }

    #[test]
    fn test_narrow_tables_skipped() {
        let html = format!(
            "<html><body><table><tr><td>每股收益</td></tr></table>\
             <table><tr><td>指标</td><td>2023-12-31</td></tr>\
             <tr><td>基本每股收益(元)</td><td>2.5</td></tr></table></body></html>"
        );
        let rows = extract_indicators(&html, &code()).unwrap();
        assert_eq!(rows[0].values.get("2023-12-31"), Some(&CellValue::Numeric(2.5)));
    }

    #[test]
    fn test_parse_quotes_pagination_sentinels() {
        assert!(parse_quotes("null").unwrap().is_empty());
        assert!(parse_quotes("[]").unwrap().is_empty());
        assert!(parse_quotes("").unwrap().is_empty());
        let quotes =
            parse_quotes(r#"[{"code":"600000","name":"浦发银行","trade":"7.21"}]"#).unwrap();
        assert_eq!(quotes.len(), 1);
    }

    #[test]
    fn test_parse_kline() {
        let bars =
            parse_kline(r#"[{"day":"2024-01-02","close":"10.5","volume":"100"}]"#).unwrap();
        assert_eq!(bars[0].day.as_deref(), Some("2024-01-02"));
        assert_eq!(bars[0].close.as_deref(), Some("10.5"));
    }
}
