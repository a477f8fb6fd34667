pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds a logger from a sloggers TOML snippet. Panics on a malformed snippet since
/// logging configuration errors should surface immediately at startup.
pub fn from_toml(toml: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).expect("Malformed logging config");

    config.build_logger().expect("Logger construction failed")
}

/// Stderr terminal logger at info level.
pub fn terminal() -> Logger {
    from_toml(DEFAULT_CONFIG)
}

/// Logger that swallows all records. Components fall back to this when the embedder
/// does not supply a logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
