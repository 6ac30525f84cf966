//! Naver Finance Quote Fetcher
//!
//! Snapshot quotes for domestic codes from the Naver mobile stock API:
//!
//! ```text
//! GET {base}/{code}/basic
//! {"stockName":"삼성전자","closePrice":"75,000","fluctuationsRatio":"0.50", ...}
//! ```
//!
//! Foreign tickers are reported as unsupported.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::runtime::Handle;

use crate::application::ports::{FetchError, QuoteFetcher};
use crate::domain::market::{Quote, canonicalize, format_change_percent, format_price};

/// Production quote API base URL.
pub const DEFAULT_QUOTE_URL: &str = "https://m.stock.naver.com/api/stock";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BasicResponse {
    #[serde(default)]
    stock_name: Option<String>,
    close_price: String,
    #[serde(default)]
    fluctuations_ratio: Option<String>,
}

/// Errors building the fetcher.
#[derive(Debug, thiserror::Error)]
pub enum QuoteClientError {
    /// Constructed outside a Tokio runtime.
    #[error("no Tokio runtime available: {0}")]
    Runtime(String),

    /// HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Blocking quote fetcher backed by an async HTTP client.
///
/// `fetch_quote` drives the request on the runtime it was created in, so it
/// must be called from a blocking thread (`spawn_blocking`), never from an
/// async task.
#[derive(Debug, Clone)]
pub struct NaverQuoteFetcher {
    client: reqwest::Client,
    base_url: String,
    runtime: Handle,
}

impl NaverQuoteFetcher {
    /// Create a fetcher bound to the current runtime.
    ///
    /// # Errors
    ///
    /// Returns error when called outside a runtime or if the HTTP client
    /// cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, QuoteClientError> {
        let runtime = Handle::try_current().map_err(|e| QuoteClientError::Runtime(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| QuoteClientError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            runtime,
        })
    }

    async fn fetch_basic(&self, code: &str) -> Result<BasicResponse, String> {
        let url = format!("{}/{code}/basic", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }

        response.json().await.map_err(|e| e.to_string())
    }
}

impl QuoteFetcher for NaverQuoteFetcher {
    fn fetch_quote(&self, symbol: &str) -> Result<Quote, FetchError> {
        let canonical = canonicalize(symbol);
        let Some(code) = canonical.upstream_code() else {
            return Err(FetchError::Unsupported {
                symbol: symbol.to_string(),
            });
        };

        let source_error = |message: String| FetchError::Source {
            symbol: symbol.to_string(),
            message,
        };

        let basic = self
            .runtime
            .block_on(self.fetch_basic(code))
            .map_err(source_error)?;

        let price = parse_decimal(&basic.close_price)
            .ok_or_else(|| source_error(format!("bad closePrice {:?}", basic.close_price)))?;
        let change = basic
            .fluctuations_ratio
            .as_deref()
            .and_then(parse_decimal)
            .unwrap_or_default();

        Ok(Quote {
            symbol: symbol.to_string(),
            price: format_price(price),
            change: format_change_percent(change),
            name: basic.stock_name,
        })
    }
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '%')
        .collect();
    cleaned.parse().ok()
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, extract::Path, http::StatusCode, response::IntoResponse, routing::get};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    async fn basic_handler(Path(code): Path<String>) -> impl IntoResponse {
        match code.as_str() {
            "005930" => (
                StatusCode::OK,
                Json(json!({
                    "stockName": "삼성전자",
                    "closePrice": "75,000",
                    "fluctuationsRatio": "0.50"
                })),
            ),
            "035720" => (
                StatusCode::OK,
                Json(json!({"closePrice": "41,250", "fluctuationsRatio": "-1.2"})),
            ),
            _ => (StatusCode::NOT_FOUND, Json(json!({"message": "not found"}))),
        }
    }

    async fn spawn_source() -> String {
        let app = Router::new().route("/api/stock/{code}/basic", get(basic_handler));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/stock")
    }

    async fn fetch(fetcher: NaverQuoteFetcher, symbol: &'static str) -> Result<Quote, FetchError> {
        tokio::task::spawn_blocking(move || fetcher.fetch_quote(symbol))
            .await
            .unwrap()
    }

    #[test]
    fn parses_formatted_numbers() {
        assert_eq!(parse_decimal("75,000"), Some(dec!(75000)));
        assert_eq!(parse_decimal(" -1.20% "), Some(dec!(-1.20)));
        assert_eq!(parse_decimal("n/a"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetches_domestic_quote() {
        let fetcher = NaverQuoteFetcher::new(spawn_source().await).unwrap();

        let quote = fetch(fetcher, "005930").await.unwrap();

        assert_eq!(quote.symbol, "005930");
        assert_eq!(quote.price, "75,000");
        assert_eq!(quote.change, "+0.50%");
        assert_eq!(quote.name.as_deref(), Some("삼성전자"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn keeps_requested_alias() {
        let fetcher = NaverQuoteFetcher::new(spawn_source().await).unwrap();

        let quote = fetch(fetcher, "035720.KQ").await.unwrap();

        assert_eq!(quote.symbol, "035720.KQ");
        assert_eq!(quote.change, "-1.20%");
        assert!(quote.name.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn foreign_symbol_is_unsupported() {
        let fetcher = NaverQuoteFetcher::new(spawn_source().await).unwrap();

        let err = fetch(fetcher, "AAPL").await.unwrap_err();

        assert_eq!(
            err,
            FetchError::Unsupported {
                symbol: "AAPL".to_string()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn http_error_is_source_error() {
        let fetcher = NaverQuoteFetcher::new(spawn_source().await).unwrap();

        let err = fetch(fetcher, "000660").await.unwrap_err();

        assert_eq!(err.kind(), "source");
    }

    #[test]
    fn requires_runtime() {
        assert!(matches!(
            NaverQuoteFetcher::new(DEFAULT_QUOTE_URL),
            Err(QuoteClientError::Runtime(_))
        ));
    }
}
