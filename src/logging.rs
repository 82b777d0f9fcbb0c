use std::io::Write;
use std::sync::Once;

use chrono::Local;
use log::LevelFilter;

static INIT: Once = Once::new();

/// Installs the global logger. `RUST_LOG` takes precedence over `level`.
/// Later calls are ignored.
pub fn init(level: LevelFilter) {
    INIT.call_once(|| {
        let result = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] {}: {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .try_init();

        if let Err(e) = result {
            eprintln!("Failed to initialize logger: {}", e);
        }
    });
}

/// Parses a config log level, falling back to `Info`.
pub fn parse_level(level: &str) -> LevelFilter {
    level.parse().unwrap_or(LevelFilter::Info)
}
