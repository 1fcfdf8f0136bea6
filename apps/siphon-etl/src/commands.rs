use crate::infra;
use siphon_application::config::{load_config, Config};
use siphon_application::pipeline;
use siphon_application::runner::{self, IntervalSchedule, RetryPolicy};
use siphon_domain::engine_name;
use siphon_domain::value_objects::storage_locator::StorageLocator;
use std::path::PathBuf;
use std::time::Duration;

pub enum Command {
    Run { config: PathBuf },
    Schedule { config: PathBuf, max_runs: Option<u64> },
    Fetch { config: PathBuf },
    Load { config: PathBuf, uri: String },
    Transform { config: PathBuf },
    Migrate { config: PathBuf, migrations: PathBuf },
}

pub fn run(command: Command) -> Result<(), String> {
    match command {
        Command::Run { config } => run_pipeline(config),
        Command::Schedule { config, max_runs } => run_schedule(config, max_runs),
        Command::Fetch { config } => run_fetch(config),
        Command::Load { config, uri } => run_load(config, uri),
        Command::Transform { config } => run_transform(config),
        Command::Migrate { config, migrations } => run_migrate(config, migrations),
    }
}

fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy::new(
        config.schedule.retries,
        Duration::from_secs(config.schedule.retry_delay_secs),
    )
}

fn print_config_summary(command: &str, config: &Config) {
    println!(
        "{} etl: {} (pipeline={}, top_n={}, interval_secs={}, retries={})",
        engine_name(),
        command,
        config.pipeline.name,
        config.api.top_n,
        config.schedule.interval_secs,
        config.schedule.retries
    );
    println!(
        "storage: root_dir={}, bucket={}, prefix={}",
        config.storage.root_dir, config.storage.bucket, config.storage.prefix
    );
    println!(
        "warehouse: project={}, dataset={}, raw_table={}, clean_table={}, source_label={}",
        config.warehouse.project,
        config.warehouse.dataset,
        config.warehouse.raw_table,
        config.warehouse.clean_table,
        config.warehouse.source_label
    );
}

fn run_pipeline(config_path: PathBuf) -> Result<(), String> {
    let config = load_config(&config_path)?;
    print_config_summary("run", &config);

    let deps = infra::build_pipeline_deps(&config)?;
    let policy = retry_policy(&config);
    let summary = pipeline::run_once(
        &config,
        &policy,
        deps.api.as_ref(),
        deps.store.as_ref(),
        deps.warehouse.as_ref(),
    )?;
    let line = serde_json::to_string(&summary)
        .map_err(|err| format!("failed to encode run summary: {err}"))?;
    println!("{line}");
    Ok(())
}

fn run_schedule(config_path: PathBuf, max_runs: Option<u64>) -> Result<(), String> {
    let config = load_config(&config_path)?;
    print_config_summary("schedule", &config);

    let deps = infra::build_pipeline_deps(&config)?;
    let policy = retry_policy(&config);
    let schedule = IntervalSchedule {
        every: Duration::from_secs(config.schedule.interval_secs),
        catchup: config.schedule.catchup,
    };
    let summary = runner::run_on_schedule(&schedule, max_runs, |run| {
        tracing::info!(run, "starting scheduled pipeline run");
        pipeline::run_once(
            &config,
            &policy,
            deps.api.as_ref(),
            deps.store.as_ref(),
            deps.warehouse.as_ref(),
        )
        .map(|summary| {
            tracing::info!(run_id = %summary.run_id, rows = summary.load.rows_loaded, "run loaded rows");
        })
    })?;
    let line = serde_json::to_string(&summary)
        .map_err(|err| format!("failed to encode schedule summary: {err}"))?;
    println!("{line}");
    Ok(())
}

fn run_fetch(config_path: PathBuf) -> Result<(), String> {
    let config = load_config(&config_path)?;
    print_config_summary("fetch", &config);

    let api = infra::build_api(&config)?;
    let store = infra::build_store(&config)?;
    let policy = retry_policy(&config);
    let output = runner::run_task("fetch_prices", &policy, || {
        pipeline::fetch_and_stage(&config, api.as_ref(), store.as_ref())
    })?;
    let line = serde_json::to_string(&output)
        .map_err(|err| format!("failed to encode fetch output: {err}"))?;
    println!("{line}");
    Ok(())
}

fn run_load(config_path: PathBuf, uri: String) -> Result<(), String> {
    let config = load_config(&config_path)?;
    print_config_summary("load", &config);

    let locator = StorageLocator::parse(&uri)?;
    let store = infra::build_store(&config)?;
    let warehouse = infra::build_warehouse(&config, store)?;
    let policy = retry_policy(&config);
    let report = runner::run_task("load_raw", &policy, || {
        pipeline::load_raw(&config, &warehouse, &locator)
    })?;
    let line = serde_json::to_string(&report)
        .map_err(|err| format!("failed to encode load report: {err}"))?;
    println!("{line}");
    Ok(())
}

fn run_transform(config_path: PathBuf) -> Result<(), String> {
    let config = load_config(&config_path)?;
    print_config_summary("transform", &config);

    let store = infra::build_store(&config)?;
    let warehouse = infra::build_warehouse(&config, store)?;
    let policy = retry_policy(&config);
    let report = runner::run_task("transform_clean", &policy, || {
        pipeline::transform_clean(&config, &warehouse)
    })?;
    let line = serde_json::to_string(&report)
        .map_err(|err| format!("failed to encode transform report: {err}"))?;
    println!("{line}");
    Ok(())
}

fn run_migrate(config_path: PathBuf, migrations: PathBuf) -> Result<(), String> {
    let config = load_config(&config_path)?;
    print_config_summary("migrate", &config);

    let sql = std::fs::read_to_string(&migrations)
        .map_err(|err| format!("failed to read migrations {}: {}", migrations.display(), err))?;
    let store = infra::build_store(&config)?;
    let warehouse = infra::build_warehouse(&config, store)?;
    warehouse.apply_migrations(&sql)?;
    println!("applied migrations from {}", migrations.display());
    Ok(())
}
