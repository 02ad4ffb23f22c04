//! Merge & export: snapshot ⟕ monthly prices ⟕ wide indicators, one JSON
//! record per security.
//!
//! The snapshot anchors the join — every snapshot security appears in the
//! output even when neither cache knows it. Every record carries the full
//! column set; absent values are explicit nulls, not omitted keys.

use crate::models::{CellValue, SnapshotRow};
use crate::reshape::WideIndicators;
use crate::storage::PriceIndex;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::info;

fn num(v: Option<f64>) -> Value {
    v.and_then(serde_json::Number::from_f64).map(Value::Number).unwrap_or(Value::Null)
}

/// Assemble the joined records.
pub fn build_records(
    snapshot: &[SnapshotRow],
    prices: &PriceIndex,
    wide: &WideIndicators,
) -> Vec<Map<String, Value>> {
    // Month columns are the union over the cache, most recent first.
    let month_columns: Vec<String> = prices
        .values()
        .flat_map(|m| m.periods.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .rev()
        .collect();

    snapshot
        .iter()
        .map(|row| {
            let mut record = Map::new();
            record.insert("代码".into(), Value::String(row.code.to_string()));
            record.insert("名称".into(), Value::String(row.name.clone()));
            record.insert("最新价".into(), num(row.price));
            record.insert("涨跌幅%".into(), num(row.change_pct));
            record.insert("总市值(万)".into(), num(row.market_cap_wan));
            record.insert("市盈率(动)".into(), num(row.pe_dynamic));
            record.insert("市净率".into(), num(row.pb));
            record.insert("换手率%".into(), num(row.turnover_pct));
            record.insert("成交额(万)".into(), num(row.amount_wan));

            let monthly = prices.get(&row.code);
            for col in &month_columns {
                let v = monthly.and_then(|m| m.periods.get(col));
                record.insert(col.clone(), num(v.copied()));
            }

            let indicators = wide.rows.get(&row.code);
            for col in &wide.columns {
                let v = indicators
                    .and_then(|r| r.get(col))
                    .map(|c| serde_json::to_value(c).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null);
                record.insert(col.clone(), v);
            }

            record
        })
        .collect()
}

/// Serialize records to the output path. Non-ASCII field names are written
/// as-is (serde_json does not escape them).
pub fn write_json(path: &Path, records: &[Map<String, Value>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {:?}", parent))?;
    }
    let json = serde_json::to_string(records).context("serialize records")?;
    fs::write(path, json).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Join and write in one step; returns the record count.
pub fn merge_and_export(
    path: &Path,
    snapshot: &[SnapshotRow],
    prices: &PriceIndex,
    wide: &WideIndicators,
) -> Result<usize> {
    let records = build_records(snapshot, prices, wide);
    write_json(path, &records)?;
    info!("exported {} records to {:?}", records.len(), path);
    Ok(records.len())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
