use call_gateway::{http, CacheKey, Gateway, GatewayError, ProducerError};
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const BASE_URL: &str = "https://api.polygon.io";

/// Prices and snapshots.
pub const QUOTE_TTL: Duration = Duration::from_secs(5 * 60);
/// Ticker details and SIC peer lists.
pub const REFERENCE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DIVIDEND_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// How far back the daily-close fallback looks for a trading day.
const DAILY_CLOSE_LOOKBACK_DAYS: i64 = 7;
/// Range searched for the most recent daily bar.
const LATEST_BAR_LOOKBACK_DAYS: i64 = 30;

/// Polygon.io REST client. Every request goes through the shared gateway,
/// so rate limiting, caching and 429 retry are handled there.
#[derive(Clone)]
pub struct PolygonClient {
    api_key: String,
    base_url: String,
    client: Client,
    gateway: Arc<Gateway>,
}

impl PolygonClient {
    pub fn new(api_key: String, gateway: Arc<Gateway>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key,
            base_url: BASE_URL.to_string(),
            client,
            gateway,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ProducerError> {
        let url = format!("{}{}", self.base_url, path);
        http::send_json(
            self.client
                .get(&url)
                .query(&[("apiKey", self.api_key.as_str())])
                .query(query),
        )
        .await
    }

    /// Previous session's adjusted close.
    pub async fn get_previous_close(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        let symbol = symbol.to_uppercase();
        let key = CacheKey::new("prev_close").param(&symbol);
        let path = format!("/v2/aggs/ticker/{}/prev", symbol);
        let path = path.as_str();

        self.gateway
            .fetch(key.as_str(), QUOTE_TTL, || async move {
                let body: AggregateResponse = self.get_json(path, &[("adjusted", "true")]).await?;
                Ok(body.results.first().map(|bar| bar.c))
            })
            .await
    }

    /// Close for a given trading day. A day without a session (404) is `None`.
    pub async fn get_daily_close(&self, symbol: &str, date: NaiveDate) -> Result<Option<f64>, GatewayError> {
        let symbol = symbol.to_uppercase();
        let date = date.format("%Y-%m-%d").to_string();
        let key = CacheKey::new("daily_close").param(&symbol).param(&date);
        let path = format!("/v1/open-close/{}/{}", symbol, date);
        let path = path.as_str();

        self.gateway
            .fetch(key.as_str(), QUOTE_TTL, || async move {
                match self.get_json::<OpenCloseResponse>(path, &[("adjusted", "true")]).await {
                    Ok(body) => Ok(body.close),
                    Err(e) if e.status_code() == Some(404) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Close of the most recent daily bar in the last month.
    pub async fn get_latest_daily_bar(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        let symbol = symbol.to_uppercase();
        let to = Utc::now().date_naive();
        let from = to - chrono::Duration::days(LATEST_BAR_LOOKBACK_DAYS);
        let to = to.format("%Y-%m-%d").to_string();
        let key = CacheKey::new("latest_bar").param(&symbol).param(&to);
        let path = format!(
            "/v2/aggs/ticker/{}/range/1/day/{}/{}",
            symbol,
            from.format("%Y-%m-%d"),
            to
        );
        let path = path.as_str();

        self.gateway
            .fetch(key.as_str(), QUOTE_TTL, || async move {
                let body: AggregateResponse = self
                    .get_json(path, &[("adjusted", "true"), ("sort", "desc"), ("limit", "1")])
                    .await?;
                Ok(body.results.first().map(|bar| bar.c))
            })
            .await
    }

    /// Near-real-time price: last quote, else last trade.
    pub async fn get_snapshot_price(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        Ok(self.get_snapshot(symbol).await?.price())
    }

    /// Snapshot for a ticker (last trade and quote, today's bar, previous day).
    pub async fn get_snapshot(&self, symbol: &str) -> Result<SnapshotTicker, GatewayError> {
        let symbol = symbol.to_uppercase();
        let key = CacheKey::new("snapshot").param(&symbol);
        let path = format!("/v2/snapshot/locale/us/markets/stocks/tickers/{}", symbol);
        let path = path.as_str();

        self.gateway
            .fetch(key.as_str(), QUOTE_TTL, || async move {
                let body: SnapshotResponse = self.get_json(path, &[]).await?;
                Ok(body.ticker)
            })
            .await
    }

    /// Best available price, trying previous close, then the close seven days
    /// back, then the live snapshot, then the latest daily bar of the past
    /// month. Each source is fetched and cached on its own; a failing source
    /// is skipped.
    pub async fn get_current_price(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        let mut last_error = None;
        let mut any_succeeded = false;

        match self.get_previous_close(symbol).await {
            Ok(Some(price)) => return Ok(Some(price)),
            Ok(None) => any_succeeded = true,
            Err(e) => {
                tracing::warn!(symbol, error = %e, "Previous close unavailable, trying daily close");
                last_error = Some(e);
            }
        }

        let date = Utc::now().date_naive() - chrono::Duration::days(DAILY_CLOSE_LOOKBACK_DAYS);
        match self.get_daily_close(symbol, date).await {
            Ok(Some(price)) => return Ok(Some(price)),
            Ok(None) => any_succeeded = true,
            Err(e) => {
                tracing::warn!(symbol, %date, error = %e, "Daily close unavailable, trying snapshot");
                last_error = Some(e);
            }
        }

        match self.get_snapshot_price(symbol).await {
            Ok(Some(price)) => return Ok(Some(price)),
            Ok(None) => any_succeeded = true,
            Err(e) => {
                tracing::warn!(symbol, error = %e, "Snapshot unavailable, trying latest daily bar");
                last_error = Some(e);
            }
        }

        match self.get_latest_daily_bar(symbol).await {
            Ok(Some(price)) => return Ok(Some(price)),
            Ok(None) => any_succeeded = true,
            Err(e) => {
                tracing::warn!(symbol, error = %e, "Latest daily bar unavailable");
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) if !any_succeeded => Err(e),
            _ => {
                tracing::debug!(symbol, "No price from any source");
                Ok(None)
            }
        }
    }

    /// Reference data for a symbol (name, exchange, market cap, SIC code).
    pub async fn get_ticker_details(&self, symbol: &str) -> Result<TickerDetails, GatewayError> {
        let symbol = symbol.to_uppercase();
        let key = CacheKey::new("ticker_details").param(&symbol);
        let path = format!("/v3/reference/tickers/{}", symbol);
        let path = path.as_str();

        self.gateway
            .fetch(key.as_str(), REFERENCE_TTL, || async move {
                let body: TickerDetailsResponse = self.get_json(path, &[]).await?;
                Ok(body.results)
            })
            .await
    }

    /// Dividend history, newest first. Plans without dividend access get an
    /// empty list.
    pub async fn get_dividends(&self, symbol: &str, limit: u32) -> Result<Vec<DividendInfo>, GatewayError> {
        let symbol = symbol.to_uppercase();
        let key = CacheKey::new("dividends").param(&symbol).param(limit);
        let limit = limit.to_string();
        let query = [
            ("ticker", symbol.as_str()),
            ("limit", limit.as_str()),
            ("order", "desc"),
        ];
        let query = &query;

        self.gateway
            .fetch(key.as_str(), DIVIDEND_TTL, || async move {
                match self.get_json::<DividendResponse>("/v3/reference/dividends", query).await {
                    Ok(body) => Ok(body.results),
                    Err(e) if matches!(e.status_code(), Some(401 | 403)) => {
                        tracing::debug!(symbol = query[0].1, "Dividends not available on this plan");
                        Ok(Vec::new())
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Active stock tickers sharing `symbol`'s SIC code, excluding `symbol`.
    pub async fn get_industry_peers(&self, symbol: &str, limit: usize) -> Result<Vec<String>, GatewayError> {
        let symbol = symbol.to_uppercase();
        let details = self.get_ticker_details(&symbol).await?;
        let Some(sic_code) = details.sic_code else {
            tracing::debug!(symbol = %symbol, "No SIC code, no industry peers");
            return Ok(Vec::new());
        };

        let key = CacheKey::new("sic_tickers").param(&sic_code).param(limit);
        // One extra so dropping the symbol itself still leaves `limit`.
        let page = (limit + 1).to_string();
        let query = [
            ("sic_code", sic_code.as_str()),
            ("market", "stocks"),
            ("active", "true"),
            ("limit", page.as_str()),
        ];
        let query = &query;

        let tickers: Vec<String> = self
            .gateway
            .fetch(key.as_str(), REFERENCE_TTL, || async move {
                let body: TickerListResponse = self.get_json("/v3/reference/tickers", query).await?;
                Ok(body.results.into_iter().map(|t| t.ticker).collect())
            })
            .await?;

        Ok(tickers
            .into_iter()
            .filter(|t| !t.eq_ignore_ascii_case(&symbol))
            .take(limit)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct AggregateResponse {
    #[serde(default)]
    results: Vec<AggregateResult>,
}

#[derive(Debug, Deserialize)]
struct AggregateResult {
    c: f64,
}

#[derive(Debug, Deserialize)]
struct OpenCloseResponse {
    close: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TickerListResponse {
    #[serde(default)]
    results: Vec<TickerListEntry>,
}

#[derive(Debug, Deserialize)]
struct TickerListEntry {
    ticker: String,
}

#[derive(Debug, Deserialize)]
struct TickerDetailsResponse {
    results: TickerDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerDetails {
    pub ticker: String,
    pub name: String,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub primary_exchange: Option<String>,
    #[serde(rename = "type", default)]
    pub ticker_type: Option<String>,
    #[serde(default)]
    pub active: bool,
    pub market_cap: Option<f64>,
    pub sic_code: Option<String>,
    pub sic_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DividendResponse {
    #[serde(default)]
    results: Vec<DividendInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendInfo {
    pub cash_amount: Option<f64>,
    pub ex_dividend_date: Option<String>,
    pub pay_date: Option<String>,
    pub declaration_date: Option<String>,
    pub frequency: Option<i32>,
    #[serde(default)]
    pub dividend_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    ticker: SnapshotTicker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTicker {
    pub day: Option<SnapshotDay>,
    #[serde(rename = "lastQuote")]
    pub last_quote: Option<SnapshotLastQuote>,
    #[serde(rename = "lastTrade")]
    pub last_trade: Option<SnapshotLastTrade>,
    #[serde(rename = "prevDay")]
    pub prev_day: Option<SnapshotDay>,
    #[serde(rename = "todaysChangePerc")]
    pub todays_change_perc: Option<f64>,
}

impl SnapshotTicker {
    pub fn price(&self) -> Option<f64> {
        self.last_quote
            .as_ref()
            .and_then(|q| q.p)
            .or_else(|| self.last_trade.as_ref().and_then(|t| t.p))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDay {
    pub o: Option<f64>,
    pub h: Option<f64>,
    pub l: Option<f64>,
    pub c: Option<f64>,
    pub v: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotLastQuote {
    pub p: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotLastTrade {
    pub p: Option<f64>,
    pub t: Option<i64>,
}
