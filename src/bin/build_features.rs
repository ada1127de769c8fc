use std::path::PathBuf;
use std::time::Instant;

use churn_features::{
    init_logging, log_app_error, log_app_finish, log_app_start, logging_config_from_env, run,
    CancelFlag, RunConfig,
};

const BINARY: &str = "build_features";

/// Usage: `build_features [run.json]`, falling back to `CHURN_CONFIG`.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(BINARY, &logging_cfg);

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CHURN_CONFIG").ok())
        .map(PathBuf::from)
        .ok_or("usage: build_features <run.json> (or set CHURN_CONFIG)")?;

    let mut config = RunConfig::from_path(&config_path)?;
    config.apply_env_overrides()?;

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || handler_flag.cancel())?;

    match run(&config, &cancel) {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            log_app_finish(BINARY, started.elapsed().as_millis() as u64);
            Ok(())
        }
        Err(err) => {
            log_app_error(BINARY, &err);
            Err(err.into())
        }
    }
}
