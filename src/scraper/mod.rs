pub mod cleaner;
pub mod http_client;
pub mod parsers;

use crate::config::FetcherConfig;
use crate::models::{IndicatorRow, MonthlyPrices, SnapshotRow, StockCode};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use self::cleaner::{clean_quote, monthly_average, segment_symbol};
use self::http_client::HttpClient;
use self::parsers::{extract_indicators, parse_kline, parse_quotes};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable data source abstraction. Per-security fetches return `Ok(None)`
/// for "no data" — only transport-level problems surface as errors, and the
/// pipeline treats both the same way (skip and count).
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<Vec<SnapshotRow>, FetchError>;
    async fn fetch_monthly_prices(
        &self,
        code: &StockCode,
    ) -> Result<Option<MonthlyPrices>, FetchError>;
    async fn fetch_indicators(
        &self,
        code: &StockCode,
    ) -> Result<Option<Vec<IndicatorRow>>, FetchError>;
}

// ── Sina endpoints ────────────────────────────────────────────────────────────

const SNAPSHOT_URL: &str =
    "http://vip.stock.finance.sina.com.cn/quotes_service/api/json_v2.php/Market_Center.getHQNodeData";
const KLINE_URL: &str =
    "https://quotes.sina.cn/cn/api/json_v2.php/CN_MarketDataService.getKLineData";
const STATEMENT_URL: &str =
    "https://money.finance.sina.com.cn/corp/go.php/vFD_FinancialGuideLine";

/// Listing pages beyond this are never requested.
const MAX_SNAPSHOT_PAGES: u32 = 100;
const SNAPSHOT_PAGE_SIZE: u32 = 80;
/// Daily bars requested per k-line call (~16 months of trading days).
const KLINE_DAYS: u32 = 400;
/// Statement bodies shorter than this are error stubs, not documents.
const MIN_STATEMENT_BYTES: usize = 800;

pub struct SinaScraper {
    client: HttpClient,
    config: FetcherConfig,
}

impl SinaScraper {
    pub fn new(config: &FetcherConfig) -> Result<Self, FetchError> {
        Ok(Self { client: HttpClient::new(config)?, config: config.clone() })
    }

    fn statement_url(&self, code: &StockCode) -> String {
        format!("{}/stockid/{}/displaytype/4.phtml", STATEMENT_URL, code)
    }
}

#[async_trait]
impl MarketDataSource for SinaScraper {
    /// Paginated full-market listing. Pagination stops on the first empty
    /// body; a failed page is skipped, not fatal — whether the overall
    /// snapshot is usable is the pipeline's call.
    async fn fetch_snapshot(&self) -> Result<Vec<SnapshotRow>, FetchError> {
        let timeout = Duration::from_secs(self.config.snapshot_timeout_secs);
        let mut rows: Vec<SnapshotRow> = Vec::new();

        for page in 1..=MAX_SNAPSHOT_PAGES {
            let page_s = page.to_string();
            let num_s = SNAPSHOT_PAGE_SIZE.to_string();
            let query = [
                ("page", page_s.as_str()),
                ("num", num_s.as_str()),
                ("sort", "changepercent"),
                ("asc", "0"),
                ("node", "hs_a"),
                ("symbol", ""),
                ("_s_r_a", "sort"),
            ];

            let quotes = match self.client.get_text(SNAPSHOT_URL, &query, timeout).await {
                Ok(body) => match parse_quotes(&body) {
                    Ok(q) => q,
                    Err(e) => {
                        warn!("listing page {}: {:#}", page, e);
                        self.client.polite_delay(self.config.snapshot_delay_ms).await;
                        continue;
                    }
                },
                Err(e) => {
                    warn!("listing page {}: {}", page, e);
                    self.client.polite_delay(self.config.snapshot_delay_ms).await;
                    continue;
                }
            };

            if quotes.is_empty() {
                debug!("empty listing page {} — stopping pagination", page);
                break;
            }

            rows.extend(quotes.iter().filter_map(clean_quote));
            self.client.polite_delay(self.config.snapshot_delay_ms).await;
        }

        info!("snapshot: {} securities", rows.len());
        Ok(rows)
    }

    /// Daily k-line → monthly average prices. Self-throttles after the
    /// request so callers can loop without their own pacing.
    async fn fetch_monthly_prices(
        &self,
        code: &StockCode,
    ) -> Result<Option<MonthlyPrices>, FetchError> {
        let symbol = segment_symbol(code);
        let datalen = KLINE_DAYS.to_string();
        let query = [
            ("symbol", symbol.as_str()),
            ("scale", "240"),
            ("ma", "no"),
            ("datalen", datalen.as_str()),
        ];

        let body = self
            .client
            .get_text(KLINE_URL, &query, Duration::from_secs(self.config.kline_timeout_secs))
            .await;
        self.client.polite_delay(self.config.kline_delay_ms).await;

        let bars = parse_kline(&body?).map_err(|e| FetchError::Malformed(format!("{:#}", e)))?;
        Ok(monthly_average(code, &bars))
    }

    /// Financial-statement page → indicator rows. GB18030-decoded; short
    /// bodies are error stubs and count as "no data".
    async fn fetch_indicators(
        &self,
        code: &StockCode,
    ) -> Result<Option<Vec<IndicatorRow>>, FetchError> {
        let url = self.statement_url(code);
        let body = self
            .client
            .get_text_gb18030(
                &url,
                &[],
                Duration::from_secs(self.config.statement_timeout_secs),
            )
            .await;
        self.client.polite_delay(self.config.statement_delay_ms).await;

        let body = body?;
        if body.len() < MIN_STATEMENT_BYTES {
            debug!("{}: statement body too short ({} bytes)", code, body.len());
            return Ok(None);
        }
        Ok(extract_indicators(&body, code))
    }
}
