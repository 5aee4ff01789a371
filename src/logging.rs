use std::sync::Once;

use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `PPK_LOG`, then `RUST_LOG`, defaulting to `info`.
fn env_level() -> LevelFilter {
    pick_level(
        std::env::var("PPK_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// `PPK_LOG` wins whenever it is set, even if `RUST_LOG` is set too.
fn pick_level(ppk: Option<&str>, rust: Option<&str>) -> LevelFilter {
    level_from(ppk.or(rust))
}

fn level_from(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|v| v.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn builder(level: LevelFilter) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .parse_filters(level_to_str(level))
        .format_timestamp_millis()
        .format_module_path(true)
        .format_target(true);
    builder
}

/// Initialize stderr logging for binaries. Safe to call more than once.
pub fn init_rust_logging() {
    init_with_level(env_level());
}

/// Same as [`init_rust_logging`] with an explicit level (e.g. from a CLI flag).
///
/// The level is final: `RUST_LOG` is not consulted here.
pub fn init_with_level(level: LevelFilter) {
    RUST_LOG_ONCE.call_once(|| {
        let _ = builder(level).try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_with_fallback() {
        assert_eq!(level_from(Some("debug")), LevelFilter::Debug);
        assert_eq!(level_from(Some("WARN")), LevelFilter::Warn);
        assert_eq!(level_from(Some("loud")), LevelFilter::Info);
        assert_eq!(level_from(None), LevelFilter::Info);
        assert_eq!(level_to_str(LevelFilter::Trace), "trace");
    }

    #[test]
    fn ppk_log_takes_precedence_over_rust_log() {
        assert_eq!(pick_level(Some("warn"), Some("trace")), LevelFilter::Warn);
        assert_eq!(pick_level(None, Some("trace")), LevelFilter::Trace);
        assert_eq!(pick_level(None, None), LevelFilter::Info);
    }

    #[test]
    fn builder_uses_the_given_level() {
        let logger = builder(LevelFilter::Error).build();
        assert_eq!(logger.filter(), LevelFilter::Error);
        let logger = builder(LevelFilter::Debug).build();
        assert_eq!(logger.filter(), LevelFilter::Debug);
    }
}
