pub trait MarketPriceApi {
    /// Asset ids of the top `limit` assets by market capitalization, descending.
    fn top_assets(&self, limit: u32) -> Result<Vec<String>, String>;

    /// Current USD price fragments keyed by asset id. Ids absent upstream are
    /// absent from the map; callers decide whether that is an error.
    fn usd_prices(&self, ids: &[String]) -> Result<serde_json::Map<String, serde_json::Value>, String>;
}
