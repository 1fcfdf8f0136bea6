use siphon_application::config::{
    ApiConfig, Config, PipelineConfig, ScheduleConfig, StorageConfig, WarehouseConfig,
};
use siphon_application::pipeline;
use siphon_application::runner::RetryPolicy;
use siphon_domain::repositories::object_store::ObjectStore;
use siphon_infrastructure::market_api::CoinGeckoMarketApi;
use siphon_infrastructure::object_store::FilesystemObjectStore;
use siphon_infrastructure::warehouse::PostgresWarehouse;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn should_run_db_tests() -> bool {
    std::env::var("SIPHON_DB_RUN_TESTS").ok().as_deref() == Some("1")
}

fn db_url() -> Option<String> {
    std::env::var("SIPHON_DB_URL").ok()
}

fn unique_suffix() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}_{}", std::process::id(), now)
}

struct MockCoinGeckoServer {
    base_url: String,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockCoinGeckoServer {
    fn start(listing_json: String, prices_json: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();

        let handle = thread::spawn(move || {
            listener.set_nonblocking(true).expect("nonblocking");
            while !stop_clone.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = handle_connection(&mut stream, &listing_json, &prices_json);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => {
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        });

        Self {
            base_url,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for MockCoinGeckoServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(
    stream: &mut TcpStream,
    listing_json: &str,
    prices_json: &str,
) -> Result<(), String> {
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .map_err(|e| e.to_string())?;
    stream
        .set_write_timeout(Some(Duration::from_secs(2)))
        .map_err(|e| e.to_string())?;

    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = stream.read(&mut tmp).map_err(|e| e.to_string())?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let body = if head.starts_with("GET /api/v3/coins/markets") {
        listing_json.as_bytes()
    } else if head.starts_with("GET /api/v3/simple/price") {
        prices_json.as_bytes()
    } else {
        b"{}"
    };
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream
        .write_all(header.as_bytes())
        .map_err(|e| e.to_string())?;
    stream.write_all(body).map_err(|e| e.to_string())?;
    Ok(())
}

fn listing_payload() -> String {
    r#"
[
  {"id": "bitcoin", "symbol": "btc", "name": "Bitcoin"},
  {"id": "ethereum", "symbol": "eth", "name": "Ethereum"},
  {"id": "tether", "symbol": "usdt", "name": "Tether"}
]
"#
    .trim()
    .to_string()
}

fn prices_payload() -> String {
    r#"
{
  "bitcoin": {"usd": 69420.5},
  "ethereum": {"usd": 3500.25},
  "tether": {"usd": 1.0}
}
"#
    .trim()
    .to_string()
}

fn build_config(base_url: &str, db_url: &str, root_dir: &str, suffix: &str) -> Config {
    Config {
        pipeline: PipelineConfig {
            name: format!("crypto_e2e_{suffix}"),
        },
        api: ApiConfig {
            base_url: Some(base_url.to_string()),
            top_n: 3,
            timeout_secs: Some(5),
        },
        storage: StorageConfig {
            root_dir: root_dir.to_string(),
            bucket: "e2e-bucket".to_string(),
            prefix: "crypto_raw".to_string(),
        },
        warehouse: WarehouseConfig {
            url: Some(db_url.to_string()),
            project: "crypto-data-engineering".to_string(),
            dataset: "crypto".to_string(),
            raw_table: format!("raw_prices_{suffix}"),
            clean_table: format!("prices_hourly_{suffix}"),
            source_label: "coingecko".to_string(),
            pool_max_size: Some(1),
        },
        schedule: ScheduleConfig {
            interval_secs: 300,
            retries: 1,
            retry_delay_secs: 0,
            catchup: false,
        },
    }
}

#[test]
fn e2e_fetch_load_transform_and_replay_dedupes() {
    if !should_run_db_tests() {
        return;
    }
    let db_url = match db_url() {
        Some(v) => v,
        None => return,
    };

    let suffix = unique_suffix();
    let server = MockCoinGeckoServer::start(listing_payload(), prices_payload());
    let tmp_dir = std::env::temp_dir().join(format!("siphon_e2e_{suffix}"));
    let _ = fs::create_dir_all(&tmp_dir);
    let config = build_config(
        &server.base_url,
        &db_url,
        tmp_dir.to_str().expect("tmp dir path"),
        &suffix,
    );

    let api = CoinGeckoMarketApi::new(Some(&server.base_url), Duration::from_secs(5))
        .expect("market api");
    let store = Arc::new(
        FilesystemObjectStore::new(tmp_dir.as_path(), &config.storage.bucket)
            .expect("object store"),
    );
    let warehouse =
        PostgresWarehouse::new(&db_url, 1, store.clone() as Arc<dyn ObjectStore>).expect("warehouse");

    let migrations_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../ops/migrations/0001_create_raw_prices.sql");
    let migrations_sql = fs::read_to_string(&migrations_path).expect("read migrations");
    warehouse.apply_migrations(&migrations_sql).expect("migrate");

    // First full run: stage, load into a fresh autodetected table, rebuild.
    let policy = RetryPolicy::none();
    let summary = pipeline::run_once(&config, &policy, &api, store.as_ref(), &warehouse)
        .expect("pipeline run");
    assert_eq!(summary.fetch.record_count, 3);
    assert_eq!(summary.load.rows_loaded, 3);
    assert!(summary.load.columns_added.is_empty());
    assert_eq!(summary.transform.rows_scanned, 3);
    assert_eq!(summary.transform.rows_written, 3);

    // Replaying the same staged blob appends duplicates to the raw table;
    // the rebuilt clean table collapses them.
    let replay = pipeline::load_raw(&config, &warehouse, &summary.fetch.locator).expect("replay");
    assert_eq!(replay.rows_loaded, 3);
    assert!(replay.columns_added.is_empty());

    let transform = pipeline::transform_clean(&config, &warehouse).expect("transform");
    assert_eq!(transform.rows_scanned, 6);
    assert_eq!(transform.rows_written, 3);

    // A blob carrying an unknown field widens the raw table in place.
    let extra = "{\"symbol\":\"SOLANA\",\"price\":150.0,\
                 \"event_ts\":\"2024-01-01T00:00:00.000000Z\",\
                 \"payload\":\"{\\\"usd\\\":150.0}\",\"volume_24h\":1234.5}\n";
    let locator = store
        .put("crypto_raw/prices_evolved.json", extra.as_bytes(), "application/json")
        .expect("stage evolved blob");
    let evolved = pipeline::load_raw(&config, &warehouse, &locator).expect("evolved load");
    assert_eq!(evolved.rows_loaded, 1);
    assert_eq!(evolved.columns_added, vec!["volume_24h".to_string()]);

    let final_transform = pipeline::transform_clean(&config, &warehouse).expect("final transform");
    assert_eq!(final_transform.rows_scanned, 7);
    assert_eq!(final_transform.rows_written, 4);
}
