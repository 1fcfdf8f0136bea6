use reqwest::blocking::Client;
use serde::Deserialize;
use siphon_domain::repositories::market_api::MarketPriceApi;
use std::time::{Duration, Instant};

const COINGECKO_BASE_URL: &str = "https://api.coingecko.com";

#[derive(Debug, Deserialize)]
struct MarketEntry {
    id: String,
}

/// Blocking CoinGecko client. Each call is a single bounded request; retrying
/// failed calls is the task runner's job, not this client's.
pub struct CoinGeckoMarketApi {
    base_url: String,
    client: Client,
}

impl CoinGeckoMarketApi {
    pub fn new(base_url: Option<&str>, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|err| format!("failed to build http client: {err}"))?;
        Ok(Self {
            base_url: base_url
                .unwrap_or(COINGECKO_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            client,
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, String> {
        let url = format!("{}{}", self.base_url, path);
        let start = Instant::now();
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .map_err(|err| {
                metrics::counter!("siphon.infra.coingecko.requests_total", "endpoint" => endpoint.to_string(), "result" => "err")
                    .increment(1);
                format!("{endpoint} request failed: {err}")
            })?;

        let status = response.status();
        if !status.is_success() {
            metrics::counter!("siphon.infra.coingecko.requests_total", "endpoint" => endpoint.to_string(), "result" => "err")
                .increment(1);
            tracing::warn!(endpoint, status = status.as_u16(), "coingecko returned non-success status");
            return Err(format!("{endpoint} request failed with status {status}"));
        }

        let parsed = response
            .json::<T>()
            .map_err(|err| format!("failed to parse {endpoint} response: {err}"))?;
        metrics::counter!("siphon.infra.coingecko.requests_total", "endpoint" => endpoint.to_string(), "result" => "ok")
            .increment(1);
        metrics::histogram!("siphon.infra.coingecko.request_ms", "endpoint" => endpoint.to_string())
            .record(start.elapsed().as_secs_f64() * 1000.0);
        tracing::debug!(endpoint, elapsed_ms = start.elapsed().as_millis() as u64, "coingecko request ok");
        Ok(parsed)
    }
}

impl MarketPriceApi for CoinGeckoMarketApi {
    fn top_assets(&self, limit: u32) -> Result<Vec<String>, String> {
        let per_page = limit.to_string();
        let entries: Vec<MarketEntry> = self.get_json(
            "markets",
            "/api/v3/coins/markets",
            &[
                ("vs_currency", "usd"),
                ("order", "market_cap_desc"),
                ("per_page", per_page.as_str()),
                ("page", "1"),
            ],
        )?;
        Ok(entries.into_iter().map(|entry| entry.id).collect())
    }

    fn usd_prices(
        &self,
        ids: &[String],
    ) -> Result<serde_json::Map<String, serde_json::Value>, String> {
        let joined = ids.join(",");
        self.get_json(
            "simple_price",
            "/api/v3/simple/price",
            &[("ids", joined.as_str()), ("vs_currencies", "usd")],
        )
    }
}
