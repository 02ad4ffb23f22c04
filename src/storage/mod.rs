//! CSV cache stores.
//!
//! Two persisted caches survive between runs: monthly average prices (one
//! row per security, one column per month) and financial indicators (one
//! row per security × indicator, one column per reporting period). Both are
//! rewritten whole at batch boundaries; the period column set is the union
//! of everything seen so far, ordered most-recent-first.
//!
//! A missing or unreadable file is an empty cache, never an error — the
//! planner recomputes the work-set from whatever loads.

use crate::models::{CellValue, IndicatorRow, MonthlyPrices, StockCode};
use crate::scraper::cleaner::normalize_code;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// UTF-8 byte-order mark, written so spreadsheet tools keep the non-ASCII
/// indicator names intact.
const BOM: &str = "\u{feff}";

const CODE_COL: &str = "股票代码";
const INDICATOR_COL: &str = "指标";

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Read a cache file into cleaned CSV records. `None` when the file is
/// missing or unreadable.
fn read_records(path: &Path) -> Option<(Vec<String>, Vec<Vec<String>>)> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            debug!("cache {:?} not loaded: {}", path, e);
            return None;
        }
    };
    let raw = raw.strip_prefix(BOM).unwrap_or(&raw);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(raw.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|s| s.trim().to_string()).collect(),
        Err(e) => {
            warn!("cache {:?} header unreadable: {}", path, e);
            return None;
        }
    };

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        match result {
            Ok(r) => rows.push(r.iter().map(|s| s.to_string()).collect()),
            Err(e) => warn!("cache {:?} row {}: {}", path, i + 1, e),
        }
    }
    Some((headers, rows))
}

/// Open a csv writer over a fresh file with a BOM already written.
fn open_writer(path: &Path) -> Result<csv::Writer<fs::File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {:?}", parent))?;
    }
    let mut file =
        fs::File::create(path).with_context(|| format!("create cache {:?}", path))?;
    file.write_all(BOM.as_bytes())?;
    Ok(csv::Writer::from_writer(file))
}

/// Period columns sorted most-recent-first (string descending — both the
/// `YYYY-MM_均价` and `YYYY-MM-DD` label forms order correctly this way).
fn sorted_desc(periods: BTreeSet<String>) -> Vec<String> {
    periods.into_iter().rev().collect()
}

// ── Price cache ───────────────────────────────────────────────────────────────

/// Monthly-average price cache: one row per security.
pub struct PriceCache {
    path: PathBuf,
}

pub type PriceIndex = BTreeMap<StockCode, MonthlyPrices>;

impl PriceCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the persisted cache. Invalid codes are dropped; duplicate codes
    /// resolve last-wins; parse failures skip the cell.
    pub fn load(&self) -> PriceIndex {
        let Some((headers, rows)) = read_records(&self.path) else {
            return PriceIndex::new();
        };

        let mut index = PriceIndex::new();
        for row in rows {
            let Some(code) = row.first().and_then(|c| normalize_code(c)) else {
                continue;
            };
            let mut periods = BTreeMap::new();
            for (i, header) in headers.iter().enumerate().skip(1) {
                if header.is_empty() {
                    continue;
                }
                if let Some(v) = row.get(i).and_then(|v| v.trim().parse::<f64>().ok()) {
                    periods.insert(header.clone(), v);
                }
            }
            index.insert(code.clone(), MonthlyPrices { code, periods });
        }
        debug!("price cache: {} securities loaded", index.len());
        index
    }

    /// Merge a fetched batch into the existing index (per-period last-wins,
    /// older periods kept), rewrite the file, and return the merged index.
    pub fn merge_and_persist(
        &self,
        mut existing: PriceIndex,
        batch: Vec<MonthlyPrices>,
    ) -> Result<PriceIndex> {
        for incoming in batch {
            existing
                .entry(incoming.code.clone())
                .or_insert_with(|| MonthlyPrices { code: incoming.code.clone(), periods: BTreeMap::new() })
                .periods
                .extend(incoming.periods);
        }
        self.persist(&existing)?;
        Ok(existing)
    }

    fn persist(&self, index: &PriceIndex) -> Result<()> {
        let columns = sorted_desc(
            index.values().flat_map(|m| m.periods.keys().cloned()).collect(),
        );

        let mut writer = open_writer(&self.path)?;
        let mut header = vec![CODE_COL.to_string()];
        header.extend(columns.iter().cloned());
        writer.write_record(&header)?;

        for monthly in index.values() {
            let mut record = vec![monthly.code.to_string()];
            for col in &columns {
                record.push(
                    monthly
                        .periods
                        .get(col)
                        .map(|v| crate::models::format_num(*v))
                        .unwrap_or_default(),
                );
            }
            writer.write_record(&record)?;
        }
        writer.flush().context("flush price cache")?;
        Ok(())
    }
}

// ── Indicator cache ───────────────────────────────────────────────────────────

/// Long-form indicator cache: one row per (security, indicator).
pub struct IndicatorCache {
    path: PathBuf,
}

pub type IndicatorIndex = BTreeMap<(StockCode, String), IndicatorRow>;

impl IndicatorCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> IndicatorIndex {
        let Some((headers, rows)) = read_records(&self.path) else {
            return IndicatorIndex::new();
        };

        // Tolerate legacy column order by locating the id columns by name.
        let code_col = headers.iter().position(|h| h.contains("代码")).unwrap_or(0);
        let ind_col = headers.iter().position(|h| h.contains(INDICATOR_COL)).unwrap_or(1);

        let mut index = IndicatorIndex::new();
        for row in rows {
            let Some(code) = row.get(code_col).and_then(|c| normalize_code(c)) else {
                continue;
            };
            let Some(indicator) = row.get(ind_col).map(|s| s.trim().to_string()) else {
                continue;
            };
            if indicator.is_empty() {
                continue;
            }

            let mut values = BTreeMap::new();
            for (i, header) in headers.iter().enumerate() {
                if i == code_col || i == ind_col || header.is_empty() {
                    continue;
                }
                let cell = row.get(i).map(|v| CellValue::classify(v)).unwrap_or(CellValue::Missing);
                if !cell.is_missing() {
                    values.insert(header.clone(), cell);
                }
            }

            // Last row wins on duplicate (code, indicator) pairs.
            index.insert(
                (code.clone(), indicator.clone()),
                IndicatorRow { code, indicator, values },
            );
        }
        debug!("indicator cache: {} rows loaded", index.len());
        index
    }

    /// Merge a fetched batch into the existing index. Period coverage
    /// accumulates across fetches: the upstream page serves a sliding
    /// window, so older periods already cached are kept and only
    /// overlapping periods are overwritten by the newer fetch.
    pub fn merge_and_persist(
        &self,
        mut existing: IndicatorIndex,
        batch: Vec<IndicatorRow>,
    ) -> Result<IndicatorIndex> {
        for incoming in batch {
            let key = (incoming.code.clone(), incoming.indicator.clone());
            existing
                .entry(key)
                .or_insert_with(|| IndicatorRow {
                    code: incoming.code.clone(),
                    indicator: incoming.indicator.clone(),
                    values: BTreeMap::new(),
                })
                .values
                .extend(incoming.values);
        }
        self.persist(&existing)?;
        Ok(existing)
    }

    /// Codes currently covered by the cache, for work-set planning.
    pub fn codes(index: &IndicatorIndex) -> BTreeSet<StockCode> {
        index.keys().map(|(code, _)| code.clone()).collect()
    }

    fn persist(&self, index: &IndicatorIndex) -> Result<()> {
        let columns = sorted_desc(
            index.values().flat_map(|r| r.values.keys().cloned()).collect(),
        );

        let mut writer = open_writer(&self.path)?;
        let mut header = vec![CODE_COL.to_string(), INDICATOR_COL.to_string()];
        header.extend(columns.iter().cloned());
        writer.write_record(&header)?;

        for row in index.values() {
            let mut record = vec![row.code.to_string(), row.indicator.clone()];
            for col in &columns {
                record.push(row.values.get(col).map(|v| v.to_field()).unwrap_or_default());
            }
            writer.write_record(&record)?;
        }
        writer.flush().context("flush indicator cache")?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
