use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

// ── Stock code ────────────────────────────────────────────────────────────────

/// Canonical 6-digit security code. Construct via `cleaner::normalize_code`;
/// every cache and join in the pipeline is keyed by this type.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StockCode(pub(crate) String);

impl StockCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StockCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Cell value ────────────────────────────────────────────────────────────────

/// A single indicator cell. Upstream tables mix numbers, placeholder dashes
/// and free text; the tag is carried through reshape and export so consumers
/// never have to re-guess the type.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Numeric(f64),
    Text(String),
    Missing,
}

impl CellValue {
    /// Classify a raw table cell. `-`, `—`, blank and `nan` are placeholders
    /// the upstream page uses for "not published".
    pub fn classify(raw: &str) -> Self {
        let s = raw.trim();
        if s.is_empty() || s == "-" || s == "—" || s.eq_ignore_ascii_case("nan") {
            return Self::Missing;
        }
        match s.replace(',', "").parse::<f64>() {
            Ok(n) => Self::Numeric(n),
            Err(_) => Self::Text(s.to_string()),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Cache-file representation; Missing round-trips as the empty field.
    pub fn to_field(&self) -> String {
        match self {
            Self::Numeric(n) => format_num(*n),
            Self::Text(s) => s.clone(),
            Self::Missing => String::new(),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Numeric(n) => serializer.serialize_f64(*n),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Missing => serializer.serialize_none(),
        }
    }
}

/// Format a float without trailing zero noise: integers stay bare,
/// "1.23" does not become "1.2300000000000001"-style output.
pub fn format_num(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// One cleaned row of the full-market quote listing. Monetary aggregates are
/// in 万 (ten-thousands of yuan).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SnapshotRow {
    pub code: StockCode,
    pub name: String,
    pub price: Option<f64>,
    pub change_pct: Option<f64>,
    pub market_cap_wan: Option<f64>,
    pub pe_dynamic: Option<f64>,
    pub pb: Option<f64>,
    pub turnover_pct: Option<f64>,
    pub amount_wan: Option<f64>,
}

/// Raw quote object as served by the listing endpoint. The feed is not
/// consistent about number vs string encoding, so everything lands as a
/// `Value` and the cleaner sorts it out.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawQuote {
    #[serde(default)]
    pub code: serde_json::Value,
    #[serde(default)]
    pub name: serde_json::Value,
    #[serde(default)]
    pub trade: serde_json::Value,
    #[serde(default)]
    pub changepercent: serde_json::Value,
    #[serde(default)]
    pub mktcap: serde_json::Value,
    #[serde(default)]
    pub per: serde_json::Value,
    #[serde(default)]
    pub pb: serde_json::Value,
    #[serde(default)]
    pub turnoverratio: serde_json::Value,
    #[serde(default)]
    pub amount: serde_json::Value,
}

// ── Daily k-line ──────────────────────────────────────────────────────────────

/// Raw daily bar from the k-line endpoint (all fields arrive as strings).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawKlineBar {
    #[serde(default)]
    pub day: Option<String>,
    #[serde(default)]
    pub close: Option<String>,
}

/// Monthly average prices for one security. Keys are cache column labels of
/// the form `YYYY-MM_均价`; at most the 12 most recent months per fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonthlyPrices {
    pub code: StockCode,
    pub periods: BTreeMap<String, f64>,
}

// ── Indicators ────────────────────────────────────────────────────────────────

/// One indicator row in the long-form cache: a security, an indicator
/// short-name and the period columns carried by the fetch it came from.
/// Period keys are the exact date strings published upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRow {
    pub code: StockCode,
    pub indicator: String,
    pub values: BTreeMap<String, CellValue>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
