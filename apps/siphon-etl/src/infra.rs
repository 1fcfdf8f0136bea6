use siphon_application::config::Config;
use siphon_domain::repositories::market_api::MarketPriceApi;
use siphon_domain::repositories::object_store::ObjectStore;
use siphon_domain::repositories::warehouse::Warehouse;
use siphon_infrastructure::market_api::CoinGeckoMarketApi;
use siphon_infrastructure::object_store::FilesystemObjectStore;
use siphon_infrastructure::warehouse::PostgresWarehouse;
use std::env;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_API_TIMEOUT_SECS: u64 = 10;
const DEFAULT_POOL_MAX_SIZE: u32 = 4;

pub struct PipelineDeps {
    pub api: Box<dyn MarketPriceApi>,
    pub store: Arc<dyn ObjectStore>,
    pub warehouse: Box<dyn Warehouse>,
}

pub fn build_pipeline_deps(config: &Config) -> Result<PipelineDeps, String> {
    let store = build_store(config)?;
    let warehouse = build_warehouse(config, store.clone())?;
    Ok(PipelineDeps {
        api: build_api(config)?,
        store,
        warehouse: Box::new(warehouse),
    })
}

pub fn build_api(config: &Config) -> Result<Box<dyn MarketPriceApi>, String> {
    let timeout = Duration::from_secs(config.api.timeout_secs.unwrap_or(DEFAULT_API_TIMEOUT_SECS));
    let api = CoinGeckoMarketApi::new(config.api.base_url.as_deref(), timeout)
        .map_err(|err| format!("failed to init market api client: {err}"))?;
    Ok(Box::new(api))
}

pub fn build_store(config: &Config) -> Result<Arc<dyn ObjectStore>, String> {
    let store = FilesystemObjectStore::new(config.storage.root_dir.as_str(), &config.storage.bucket)?;
    Ok(Arc::new(store))
}

pub fn build_warehouse(
    config: &Config,
    store: Arc<dyn ObjectStore>,
) -> Result<PostgresWarehouse, String> {
    let db_url = resolve_db_url(config)?;
    let pool_max_size = config
        .warehouse
        .pool_max_size
        .unwrap_or(DEFAULT_POOL_MAX_SIZE);
    PostgresWarehouse::new(&db_url, pool_max_size, store)
}

fn resolve_db_url(config: &Config) -> Result<String, String> {
    match config.warehouse.url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(url.to_string()),
        _ => env::var("SIPHON_DB_URL").map_err(|_| {
            "missing warehouse.url in config and env SIPHON_DB_URL is not set".to_string()
        }),
    }
}
