use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, Layer};

/// Init logging using env variables LOG_LEVEL and LOG_COLORIZE:
///     - LOG_LEVEL may be TRACE, DEBUG, INFO, WARN or ERROR (default to INFO)
///     - LOG_COLORIZE may be "false" or "true" (default to "true" or ansi supported platforms)
pub fn init_logging(json_output: bool) {
    // STDOUT/STDERR layer
    let ansi = std::env::var("LOG_COLORIZE").map_or(true, |value| value != "false");
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_ansi(ansi)
        .with_line_number(true);

    let fmt_layer = match json_output {
        true => fmt_layer.json().flatten_event(true).boxed(),
        false => fmt_layer.boxed(),
    };

    // Filter events with LOG_LEVEL
    let env_filter = match std::env::var("LOG_LEVEL") {
        Ok(log_level) => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .parse_lossy(filter_directives(&log_level)),
        Err(_) => EnvFilter::new("info"),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Plain levels only apply to the pool crates so dependencies do not spam the logs
fn filter_directives(log_level: &str) -> &str {
    match log_level {
        "warn" => "inference_pool_router=warn,inference_pool_client=warn",
        "info" => "inference_pool_router=info,inference_pool_client=info",
        "debug" => "inference_pool_router=debug,inference_pool_client=debug",
        log_level => log_level,
    }
}
