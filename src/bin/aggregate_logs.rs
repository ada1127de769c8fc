use std::path::PathBuf;
use std::time::Instant;

use churn_features::{
    aggregate_log, init_logging, log_app_error, log_app_finish, log_app_start,
    logging_config_from_env, publish, user_log_measures, AggregateOptions, AggregationSpec,
    CancelFlag, LogSourceConfig, RunConfig,
};

const BINARY: &str = "aggregate_logs";

/// Usage: `aggregate_logs <user_logs.csv|.zip> [output.csv]`
///
/// Chunk size, worker count and the default output path come from
/// `CHURN_CHUNK_SIZE`, `CHURN_WORKERS` and `CHURN_OUTPUT`.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(BINARY, &logging_cfg);

    let mut args = std::env::args().skip(1);
    let input = args
        .next()
        .map(PathBuf::from)
        .ok_or("usage: aggregate_logs <user_logs.csv|.zip> [output.csv]")?;

    let mut settings = RunConfig::default();
    settings.apply_env_overrides()?;
    if let Some(output) = args.next() {
        settings.output = PathBuf::from(output);
    }

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || handler_flag.cancel())?;

    let source = LogSourceConfig::new(input);
    let spec = AggregationSpec::new(user_log_measures());
    let options = AggregateOptions::new(&settings.entity_column, settings.chunk_size)
        .with_workers(settings.workers);

    let result = aggregate_log("user_logs", &source, &spec, &options, &cancel).and_then(
        |(table, report)| {
            cancel.check()?;
            let published = publish(&table, &settings.output)?;
            Ok((report, published))
        },
    );

    match result {
        Ok((report, published)) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "aggregate": report,
                    "published": published,
                }))?
            );
            log_app_finish(BINARY, started.elapsed().as_millis() as u64);
            Ok(())
        }
        Err(err) => {
            log_app_error(BINARY, &err);
            Err(err.into())
        }
    }
}
