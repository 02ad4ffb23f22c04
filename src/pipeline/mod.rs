//! Pipeline orchestrator: snapshot → price backfill → financial backfill →
//! merge & export.
//!
//! ## Run shape
//!
//! `run()` — full run (cron use):
//!   1. Paginated market snapshot. Empty snapshot aborts the run; nothing
//!      downstream is touched.
//!   2. Monthly-price backfill for snapshot securities the price cache does
//!      not cover yet, up to the per-run budget.
//!   3. Financial-indicator backfill, same planning, separate budget.
//!   4. Reshape the indicator cache long→wide and export the joined JSON.
//!
//! Backfill loops are strictly sequential — one request in flight, fixed
//! delay between requests — and flush to the cache every `BATCH_FLUSH`
//! securities, so an interrupted run keeps everything flushed and the next
//! run's work-set shrinks accordingly. A failed security is counted and
//! skipped; it never aborts the loop.

use crate::config::AppConfig;
use crate::export;
use crate::models::{IndicatorRow, MonthlyPrices, StockCode};
use crate::planner;
use crate::reshape;
use crate::scraper::{MarketDataSource, SinaScraper};
use crate::storage::{IndicatorCache, PriceCache};
use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Securities buffered between cache flushes.
const BATCH_FLUSH: usize = 5;
/// Price-loop progress logging cadence.
const PROGRESS_EVERY: usize = 50;

pub struct Pipeline {
    config: AppConfig,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub snapshot_rows: usize,
    pub prices_planned: usize,
    pub prices_fetched: usize,
    pub price_errors: usize,
    pub financial_planned: usize,
    pub financial_fetched: usize,
    pub financial_errors: usize,
    pub exported: usize,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<PipelineStats> {
        let scraper = SinaScraper::new(&self.config.fetcher).context("build scraper")?;
        self.run_with_source(&scraper, true).await
    }

    /// Export-only run: fresh snapshot joined against the caches as they
    /// stand, no per-security fetches.
    pub async fn export_only(&self) -> Result<PipelineStats> {
        let scraper = SinaScraper::new(&self.config.fetcher).context("build scraper")?;
        self.run_with_source(&scraper, false).await
    }

    pub async fn run_with_source(
        &self,
        source: &dyn MarketDataSource,
        backfill: bool,
    ) -> Result<PipelineStats> {
        let mut stats = PipelineStats::default();

        // ── 1. Market snapshot ───────────────────────────────────────────────
        info!("=== Step 1: Market snapshot ===");
        let snapshot = source.fetch_snapshot().await.context("snapshot fetch")?;
        if snapshot.is_empty() {
            bail!("no usable snapshot data — aborting run");
        }
        stats.snapshot_rows = snapshot.len();
        let target: Vec<StockCode> = snapshot.iter().map(|r| r.code.clone()).collect();

        // ── 2. Monthly-price backfill ────────────────────────────────────────
        let price_cache = PriceCache::new(&self.config.cache.price_path);
        let mut price_index = price_cache.load();

        if backfill {
            let cached: BTreeSet<StockCode> = price_index.keys().cloned().collect();
            let todo =
                planner::plan(&target, &cached, self.config.limits.price_backfill);
            stats.prices_planned = todo.len();
            info!(
                "=== Step 2: Price backfill — {} cached, {} to fetch ===",
                cached.len(),
                todo.len()
            );

            let mut buffer: Vec<MonthlyPrices> = Vec::new();
            for (i, code) in todo.iter().enumerate() {
                if i % PROGRESS_EVERY == 0 {
                    info!("price backfill: {}/{}", i, todo.len());
                }
                match source.fetch_monthly_prices(code).await {
                    Ok(Some(monthly)) => {
                        buffer.push(monthly);
                        stats.prices_fetched += 1;
                    }
                    Ok(None) => {
                        debug!("{}: no price data", code);
                        stats.price_errors += 1;
                    }
                    Err(e) => {
                        debug!("{}: price fetch failed: {}", code, e);
                        stats.price_errors += 1;
                    }
                }
                if buffer.len() >= BATCH_FLUSH {
                    price_index = price_cache
                        .merge_and_persist(price_index, std::mem::take(&mut buffer))
                        .context("flush price cache")?;
                }
            }
            if !buffer.is_empty() {
                price_index = price_cache
                    .merge_and_persist(price_index, buffer)
                    .context("flush price cache")?;
            }
        }

        // ── 3. Financial-indicator backfill ──────────────────────────────────
        let fin_cache = IndicatorCache::new(&self.config.cache.financial_path);
        let mut fin_index = fin_cache.load();

        if backfill {
            let cached = IndicatorCache::codes(&fin_index);
            let todo =
                planner::plan(&target, &cached, self.config.limits.financial_backfill);
            stats.financial_planned = todo.len();
            info!(
                "=== Step 3: Financial backfill — {} cached, {} to fetch ===",
                cached.len(),
                todo.len()
            );

            let mut buffer: Vec<IndicatorRow> = Vec::new();
            let mut buffered = 0usize;
            for (i, code) in todo.iter().enumerate() {
                match source.fetch_indicators(code).await {
                    Ok(Some(rows)) => {
                        info!("[{}/{}] {}: {} indicators", i + 1, todo.len(), code, rows.len());
                        buffer.extend(rows);
                        buffered += 1;
                        stats.financial_fetched += 1;
                    }
                    Ok(None) => {
                        info!("[{}/{}] {}: no data", i + 1, todo.len(), code);
                        stats.financial_errors += 1;
                    }
                    Err(e) => {
                        info!("[{}/{}] {}: fetch failed: {}", i + 1, todo.len(), code, e);
                        stats.financial_errors += 1;
                    }
                }
                if buffered >= BATCH_FLUSH {
                    fin_index = fin_cache
                        .merge_and_persist(fin_index, std::mem::take(&mut buffer))
                        .context("flush indicator cache")?;
                    buffered = 0;
                }
            }
            if !buffer.is_empty() {
                fin_index = fin_cache
                    .merge_and_persist(fin_index, buffer)
                    .context("flush indicator cache")?;
            }
        }

        // ── 4. Reshape, merge & export ───────────────────────────────────────
        info!("=== Step 4: Export ({} indicator rows cached) ===", fin_index.len());
        let wide = reshape::pivot_indicators(&fin_index);

        // Degraded output beats no output: an unreadable indicator cache
        // already loaded as empty above, so a snapshot-only file is still
        // written. The write itself is the only fatal step left.
        stats.exported = export::merge_and_export(
            &self.config.cache.output_path,
            &snapshot,
            &price_index,
            &wide,
        )
        .context("merge & export")?;

        info!(
            "=== Done: {} snapshot | prices {}/{} ({} errors) | financials {}/{} ({} errors) | {} exported ===",
            stats.snapshot_rows,
            stats.prices_fetched,
            stats.prices_planned,
            stats.price_errors,
            stats.financial_fetched,
            stats.financial_planned,
            stats.financial_errors,
            stats.exported,
        );

        Ok(stats)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CellValue, SnapshotRow};
    use crate::scraper::cleaner::normalize_code;
    use crate::scraper::FetchError;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Scripted source: serves a fixed snapshot, per-code canned results,
    /// and records fetch order.
    struct FakeSource {
        snapshot: Vec<SnapshotRow>,
        prices: BTreeMap<StockCode, MonthlyPrices>,
        indicators: BTreeMap<StockCode, Vec<IndicatorRow>>,
        fetched: Mutex<Vec<StockCode>>,
    }

    impl FakeSource {
        fn new(snapshot: Vec<SnapshotRow>) -> Self {
            Self {
                snapshot,
                prices: BTreeMap::new(),
                indicators: BTreeMap::new(),
                fetched: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for FakeSource {
        async fn fetch_snapshot(&self) -> Result<Vec<SnapshotRow>, FetchError> {
            Ok(self.snapshot.clone())
        }

        async fn fetch_monthly_prices(
            &self,
            code: &StockCode,
        ) -> Result<Option<MonthlyPrices>, FetchError> {
            self.fetched.lock().unwrap().push(code.clone());
            Ok(self.prices.get(code).cloned())
        }

        async fn fetch_indicators(
            &self,
            code: &StockCode,
        ) -> Result<Option<Vec<IndicatorRow>>, FetchError> {
            Ok(self.indicators.get(code).cloned())
        }
    }

    fn code(s: &str) -> StockCode {
        normalize_code(s).unwrap()
    }

    fn snap(c: &str, price: f64) -> SnapshotRow {
        SnapshotRow {
            code: code(c),
            name: String::new(),
            price: Some(price),
            change_pct: None,
            market_cap_wan: None,
            pe_dynamic: None,
            pb: None,
            turnover_pct: None,
            amount_wan: None,
        }
    }

    fn test_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.cache.price_path = dir.join("prices.csv");
        config.cache.financial_path = dir.join("fin.csv");
        config.cache.output_path = dir.join("data.json");
        config
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(Vec::new());
        let pipeline = Pipeline::new(test_config(dir.path()));
        assert!(pipeline.run_with_source(&source, true).await.is_err());
        assert!(!dir.path().join("data.json").exists());
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FakeSource::new(vec![snap("600000", 7.2), snap("000001", 10.0)]);
        // Only 600000 has data; 000001 yields "no data" everywhere.
        let mut periods = BTreeMap::new();
        periods.insert("2024-01_均价".to_string(), 7.1);
        source
            .prices
            .insert(code("600000"), MonthlyPrices { code: code("600000"), periods });

        let pipeline = Pipeline::new(test_config(dir.path()));
        let stats = pipeline.run_with_source(&source, true).await.unwrap();

        assert_eq!(stats.snapshot_rows, 2);
        assert_eq!(stats.prices_fetched, 1);
        assert_eq!(stats.price_errors, 1);
        assert_eq!(stats.financial_fetched, 0);
        assert_eq!(stats.financial_errors, 2);
        assert_eq!(stats.exported, 2);
    }

    #[tokio::test]
    async fn test_second_run_skips_cached_securities() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FakeSource::new(vec![snap("600000", 7.2), snap("000001", 10.0)]);
        for c in ["600000", "000001"] {
            let mut periods = BTreeMap::new();
            periods.insert("2024-01_均价".to_string(), 1.0);
            source.prices.insert(code(c), MonthlyPrices { code: code(c), periods });
        }

        let pipeline = Pipeline::new(test_config(dir.path()));
        pipeline.run_with_source(&source, true).await.unwrap();
        assert_eq!(source.fetched.lock().unwrap().len(), 2);

        // Re-run: the price cache now covers both codes.
        pipeline.run_with_source(&source, true).await.unwrap();
        assert_eq!(source.fetched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_end_to_end_export_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FakeSource::new(vec![snap("000001", 10.0)]);
        let mut values = BTreeMap::new();
        values.insert("2023-12-31".to_string(), CellValue::Numeric(1.23));
        source.indicators.insert(
            code("000001"),
            vec![IndicatorRow {
                code: code("000001"),
                indicator: "EPS".to_string(),
                values,
            }],
        );

        let pipeline = Pipeline::new(test_config(dir.path()));
        let stats = pipeline.run_with_source(&source, true).await.unwrap();
        assert_eq!(stats.exported, 1);

        let raw = std::fs::read_to_string(dir.path().join("data.json")).unwrap();
        let records: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_str(&raw).unwrap();
        assert_eq!(records[0]["代码"], serde_json::json!("000001"));
        assert_eq!(records[0]["最新价"], serde_json::json!(10.0));
        assert_eq!(records[0]["2023-12-31_EPS"], serde_json::json!(1.23));
    }

    #[tokio::test]
    async fn test_corrupt_indicator_cache_exports_snapshot_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(&config.cache.financial_path, b"\xff\xfe not a csv \x00").unwrap();

        let source = FakeSource::new(vec![snap("000001", 10.0)]);
        let pipeline = Pipeline::new(config);
        let stats = pipeline.run_with_source(&source, false).await.unwrap();
        assert_eq!(stats.exported, 1);

        let raw = std::fs::read_to_string(dir.path().join("data.json")).unwrap();
        let records: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_str(&raw).unwrap();
        // Snapshot fields only — the unreadable cache contributes nothing,
        // but the run still produces output.
        assert_eq!(records[0]["最新价"], serde_json::json!(10.0));
        assert!(records[0].keys().all(|k| !k.contains('_')));
    }

    #[tokio::test]
    async fn test_export_only_skips_backfill() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FakeSource::new(vec![snap("600000", 7.2)]);
        let mut periods = BTreeMap::new();
        periods.insert("2024-01_均价".to_string(), 7.1);
        source
            .prices
            .insert(code("600000"), MonthlyPrices { code: code("600000"), periods });

        let pipeline = Pipeline::new(test_config(dir.path()));
        let stats = pipeline.run_with_source(&source, false).await.unwrap();
        assert_eq!(stats.exported, 1);
        assert_eq!(stats.prices_planned, 0);
        assert!(source.fetched.lock().unwrap().is_empty());
    }
}
