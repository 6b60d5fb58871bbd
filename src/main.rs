//! txsql - Main entry point.
//!
//! Runs one SQL statement through the transactional SQL service inside its own
//! unit of work and prints the result as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;
use txsql::config::{Config, ExecMode};
use txsql::db::SqlService;
use txsql::error::SqlError;
use txsql::models::{BindBase, Value};
use txsql::server::{JobInput, JobManager, ServerSession};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Command line bind values are integers when they parse as one, text otherwise.
fn bind_value(raw: &str) -> Value {
    match raw.parse::<i64>() {
        Ok(n) => Value::Int(n),
        Err(_) => Value::from(raw),
    }
}

async fn execute(service: SqlService, config: Config) -> Result<serde_json::Value, SqlError> {
    let binds: BTreeMap<String, Value> = config
        .parse_binds()
        .map_err(SqlError::illegal_argument)?
        .into_iter()
        .map(|(name, value)| (name, bind_value(&value)))
        .collect();
    let bases = [BindBase::Map(binds)];

    if config.mode == ExecMode::Plain {
        let text = service.create_plain_text(&config.sql, &bases)?;
        return Ok(serde_json::Value::String(text));
    }

    let jobs = JobManager::new();
    let session = Arc::new(ServerSession::new(config.username.clone()));
    let job = jobs.run_now(JobInput::new("txsql", session), move |ctx| async move {
        let tx = ctx.transaction();
        match config.mode {
            ExecMode::Update => {
                let count = service.update(tx, &config.sql, &bases).await?;
                Ok(serde_json::json!({ "rows_affected": count }))
            }
            _ => {
                let rows = service
                    .select_limited(tx, &config.sql, config.max_rows.unwrap_or(0), &bases)
                    .await?;
                serde_json::to_value(&rows)
                    .map_err(|e| SqlError::internal(format!("Failed to serialize rows: {}", e)))
            }
        }
    });

    let cancel_jobs = jobs.clone();
    tokio::select! {
        result = job => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling running transactions");
            for id in cancel_jobs.running_jobs() {
                cancel_jobs.cancel(&id);
            }
            Err(SqlError::cancelled("interrupted"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    info!(mode = %config.mode, "Starting txsql v{}", env!("CARGO_PKG_VERSION"));

    let service = SqlService::builder(config.service_config()).build()?;

    let result = execute(service.clone(), config).await;
    if let Some(inventory) = service.inventory() {
        info!(inventory = %inventory, "Connection pool inventory");
    }
    service.close().await;

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Statement failed");
            Err(e.into())
        }
    }
}
