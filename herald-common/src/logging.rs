use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Emit an event inside a span named after its category. Reached through
/// [`internal!`] and [`outgoing!`].
#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Traffic handed to a transport
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

/// Engine bookkeeping (run lifecycle, worker pool)
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

/// Checked in order; the first one set decides the level
const LEVEL_VARS: [&str; 2] = ["HERALD_LOG", "LOG_LEVEL"];

/// Level named by `value`, or `default` when it is unset or not a level
fn parse_level(value: Option<&str>, default: LevelFilter) -> LevelFilter {
    value.map_or(default, |level| {
        LevelFilter::from_str(level.trim()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

/// Install the global subscriber. Only `herald*` targets are printed, which
/// includes the `herald::audit` trail.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let configured = LEVEL_VARS.iter().find_map(|name| std::env::var(name).ok());
    let level = parse_level(configured.as_deref(), default);

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("herald")
                })),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level(None, LevelFilter::INFO), LevelFilter::INFO);
        assert_eq!(parse_level(Some("debug"), LevelFilter::INFO), LevelFilter::DEBUG);
        assert_eq!(parse_level(Some(" WARN "), LevelFilter::INFO), LevelFilter::WARN);
        assert_eq!(parse_level(Some("off"), LevelFilter::INFO), LevelFilter::OFF);
        assert_eq!(parse_level(Some("loud"), LevelFilter::ERROR), LevelFilter::ERROR);
    }
}
