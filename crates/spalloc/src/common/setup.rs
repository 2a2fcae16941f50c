use std::io::Write;

use env_logger::DEFAULT_FILTER_ENV;
use log::LevelFilter;

/// Sets the behavior of the logger, based on passed environment variables
/// such as `RUST_LOG`.
pub fn setup_logging(debug: bool) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let has_debug = std::env::var(DEFAULT_FILTER_ENV)
        .map(|v| v.contains("debug"))
        .unwrap_or(false);

    if debug || has_debug {
        builder.format_timestamp_millis();
    } else {
        // <time> <level> <target> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                buf.timestamp_seconds(),
                record.level(),
                record.target(),
                record.args()
            )
        });
    }

    builder.parse_default_env();
    builder.init();
}
