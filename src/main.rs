use std::{process, sync::OnceLock};

use sensebee::{
    config::{Config, ConfigTree, DEFAULT_INTERVAL},
    core::{executor::Executor, guard::ProcessGuard},
    logger::LoggerManager,
    print_error,
};
use tracing::{debug, error, info};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn log_sensors_table(tree: &ConfigTree) {
    let rows: Vec<(String, String, String, &str)> = tree
        .sensors()
        .iter()
        .map(|entry| {
            let name = entry.get_str("Name").unwrap_or("<unnamed>").to_string();
            let backend = entry.get_str("Backend").unwrap_or("-").to_string();
            let interval = match entry.get("Interval") {
                Some(value) => value.to_string().trim_matches('"').to_string(),
                None => DEFAULT_INTERVAL.to_string(),
            };
            let status = if entry.get_bool("Active") == Some(false) {
                "INACTIVE"
            } else {
                "ACTIVE"
            };
            (name, backend, interval, status)
        })
        .collect();

    let name_width = rows
        .iter()
        .map(|r| r.0.len())
        .max()
        .unwrap_or(10)
        .max("Sensor".len());
    let backend_width = rows
        .iter()
        .map(|r| r.1.len())
        .max()
        .unwrap_or(7)
        .max("Backend".len());

    info!(
        "{:<nw$} | {:<bw$} | {:<8} | Status",
        "Sensor",
        "Backend",
        "Interval",
        nw = name_width,
        bw = backend_width
    );
    info!(
        "{}-+-{}-+-{}-+-{}",
        "-".repeat(name_width),
        "-".repeat(backend_width),
        "-".repeat(8),
        "-".repeat(8)
    );
    for (name, backend, interval, status) in &rows {
        info!(
            "{:<nw$} | {:<bw$} | {:<8} | {}",
            name,
            backend,
            interval,
            status,
            nw = name_width,
            bw = backend_width
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting sensebee version {}...", env!("CARGO_PKG_VERSION"));
    debug!("{:#?}", cfg);
    info!("Log level: {}", cfg.logger.level);

    let _guard = match ProcessGuard::acquire(&cfg.agent.pid_file) {
        Ok(Some(guard)) => guard,
        Ok(None) => return Ok(()),
        Err(e) => {
            error!("Failed to take the process lock: {}", e);
            process::exit(1);
        }
    };

    log_sensors_table(&cfg.tree);

    let executor = match Executor::from_config(cfg) {
        Ok(executor) => executor,
        Err(e) => {
            error!("Invalid sensor configuration: {}", e);
            return Err(e.into());
        }
    };
    if executor.sensors().is_empty() {
        info!("No active sensors configured, only the broker connection will be kept");
    }

    tokio::select! {
        _ = executor.run() => {
            error!("Executor unexpectedly finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }
    Ok(())
}
