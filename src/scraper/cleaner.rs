use crate::models::{MonthlyPrices, RawKlineBar, RawQuote, SnapshotRow, StockCode};
use chrono::NaiveDate;
use std::collections::BTreeMap;

// ── Code normalization ────────────────────────────────────────────────────────

/// Canonicalize a raw security identifier to a 6-digit, left-zero-padded
/// code. The feed mixes plain codes ("600000"), bare integers (1) and
/// decimal re-encodings ("1.0"); header tokens and blanks leak into cached
/// files and must yield no key at all.
///
/// Idempotent: an already-canonical code comes back unchanged.
pub fn normalize_code(raw: &str) -> Option<StockCode> {
    let s = raw.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("nan") || s.contains("代码") {
        return None;
    }

    let n = s.parse::<f64>().ok()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    let code = n.trunc() as u64;
    if code > 999_999 {
        return None;
    }
    Some(StockCode(format!("{:06}", code)))
}

// ── Exchange segment ──────────────────────────────────────────────────────────

/// Prefix a canonical code with its market-segment symbol:
/// `6*` → Shanghai, `0*`/`3*` → Shenzhen, `8*`/`4*` → Beijing.
/// Anything else falls back to Shenzhen.
pub fn segment_symbol(code: &StockCode) -> String {
    let prefix = match code.as_str().chars().next() {
        Some('6') => "sh",
        Some('0') | Some('3') => "sz",
        Some('8') | Some('4') => "bj",
        _ => "sz",
    };
    format!("{}{}", prefix, code)
}

// ── JSON field coercion ───────────────────────────────────────────────────────

/// Pull a float out of a JSON field that may be a number or a numeric string.
pub fn value_to_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s == "-" {
                return None;
            }
            s.replace(',', "").parse().ok()
        }
        _ => None,
    }
}

pub fn value_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() { None } else { Some(s.to_string()) }
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Yuan → 万 (ten-thousands), 2 dp.
pub fn to_wan(x: f64) -> f64 {
    round2(x / 10_000.0)
}

// ── Raw quote → SnapshotRow ───────────────────────────────────────────────────

/// Clean one raw listing quote. Rows whose code does not canonicalize are
/// dropped. Turnover amount arrives in yuan and is converted to 万; market
/// cap is already 万 upstream and is only rounded.
pub fn clean_quote(raw: &RawQuote) -> Option<SnapshotRow> {
    let code = normalize_code(&value_to_string(&raw.code)?)?;

    Some(SnapshotRow {
        code,
        name: value_to_string(&raw.name).unwrap_or_default(),
        price: value_to_f64(&raw.trade),
        change_pct: value_to_f64(&raw.changepercent),
        market_cap_wan: value_to_f64(&raw.mktcap).map(round2),
        pe_dynamic: value_to_f64(&raw.per),
        pb: value_to_f64(&raw.pb),
        turnover_pct: value_to_f64(&raw.turnoverratio),
        amount_wan: value_to_f64(&raw.amount).map(to_wan),
    })
}

// ── Daily bars → monthly averages ─────────────────────────────────────────────

/// Number of trailing months kept per security.
pub const MONTHS_KEPT: usize = 12;

/// Bucket daily closes by calendar month, average each bucket, and keep the
/// `MONTHS_KEPT` most recent months. Column labels follow the cache schema:
/// `YYYY-MM_均价`.
pub fn monthly_average(code: &StockCode, bars: &[RawKlineBar]) -> Option<MonthlyPrices> {
    let mut buckets: BTreeMap<String, (f64, u32)> = BTreeMap::new();

    for bar in bars {
        let Some(day) = bar.day.as_deref() else { continue };
        let Ok(date) = NaiveDate::parse_from_str(day.trim(), "%Y-%m-%d") else {
            continue;
        };
        let Some(close) = bar.close.as_deref().and_then(|c| c.trim().parse::<f64>().ok())
        else {
            continue;
        };
        let e = buckets.entry(date.format("%Y-%m").to_string()).or_insert((0.0, 0));
        e.0 += close;
        e.1 += 1;
    }

    if buckets.is_empty() {
        return None;
    }

    // BTreeMap iterates ascending; take the last MONTHS_KEPT months.
    let periods: BTreeMap<String, f64> = buckets
        .iter()
        .rev()
        .take(MONTHS_KEPT)
        .map(|(ym, (sum, n))| (format!("{}_均价", ym), round2(sum / *n as f64)))
        .collect();

    Some(MonthlyPrices { code: code.clone(), periods })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
