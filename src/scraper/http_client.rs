use crate::config::FetcherConfig;
use crate::scraper::FetchError;
use rand::seq::IndexedRandom;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Referer sent with every request; the upstream endpoints reject bare
/// clients without one.
const REFERER: &str = "https://finance.sina.com.cn/";

/// Thin reqwest wrapper: rotating client identity, per-request timeout,
/// fixed polite delay. No retries — callers treat a failed item as
/// "no data" and move on.
pub struct HttpClient {
    inner: reqwest::Client,
    user_agents: Vec<String>,
}

impl HttpClient {
    pub fn new(config: &FetcherConfig) -> Result<Self, FetchError> {
        let inner = reqwest::Client::builder()
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .no_proxy()
            .build()?;

        Ok(Self { inner, user_agents: config.user_agents.clone() })
    }

    fn random_user_agent(&self) -> &str {
        self.user_agents
            .choose(&mut rand::rng())
            .map(|s| s.as_str())
            .unwrap_or("Mozilla/5.0")
    }

    async fn get(
        &self,
        url: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<reqwest::Response, FetchError> {
        debug!("GET {}", url);
        let resp = self
            .inner
            .get(url)
            .query(query)
            .header("User-Agent", self.random_user_agent())
            .header("Referer", REFERER)
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        Ok(resp)
    }

    /// Fetch a URL as UTF-8 text.
    pub async fn get_text(
        &self,
        url: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<String, FetchError> {
        Ok(self.get(url, query, timeout).await?.text().await?)
    }

    /// Fetch a URL as text decoded as GB18030 (the statement pages predate
    /// UTF-8 and carry no charset header worth trusting).
    pub async fn get_text_gb18030(
        &self,
        url: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<String, FetchError> {
        Ok(self
            .get(url, query, timeout)
            .await?
            .text_with_charset("gb18030")
            .await?)
    }

    /// Fixed inter-request delay — the only rate limiting the upstream asks
    /// for, and all this client provides.
    pub async fn polite_delay(&self, delay_ms: u64) {
        sleep(Duration::from_millis(delay_ms)).await;
    }
}
