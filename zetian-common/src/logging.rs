//! Protocol-aware logging on top of `tracing`.
//!
//! Every log line a server emits falls into one of three directions:
//! `incoming` (client → server lines), `outgoing` (replies), and
//! `internal` (everything the server does on its own). The macros below
//! tag each event with that direction as a structured field, so
//! subscribers can split a session transcript from operational noise
//! without parsing message text.

use chrono::{SecondsFormat, Utc};
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, fmt::time::FormatTime, layer::SubscriberExt, util::SubscriberInitExt,
};

/// RFC 3339 timestamps with microsecond precision, the same wall clock
/// that stamps `Received:` trace headers.
struct Rfc3339;

impl FormatTime for Rfc3339 {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        w.write_str(&Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

/// The common core of the direction macros: one `tracing` event on the
/// `zetian` target carrying a `direction` field.
#[macro_export]
macro_rules! log {
    ($dir:literal, level = $level:ident, $($msg:expr),*) => {
        $crate::tracing::event!(
            target: "zetian",
            $crate::tracing::Level::$level,
            direction = $dir,
            $($msg),*
        )
    };
}

/// A command line received from the client. Defaults to TRACE.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!("incoming", level = $level, $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

/// A reply on its way to the client. Defaults to TRACE.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!("outgoing", level = $level, $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

/// Server-side activity with no wire counterpart. Defaults to TRACE.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!("internal", level = $level, $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

fn level() -> LevelFilter {
    std::env::var("LOG_LEVEL").map_or(
        if cfg!(debug_assertions) {
            LevelFilter::TRACE
        } else {
            LevelFilter::INFO
        },
        |level| match level.to_ascii_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" => LevelFilter::WARN,
            _ => LevelFilter::ERROR,
        },
    )
}

/// Install a default subscriber for embedding applications that don't
/// bring their own: compact single-line output, `zetian` events only,
/// level taken from `LOG_LEVEL` when set.
///
/// An application with its own `tracing` setup should skip this and
/// filter on the `zetian` target and `direction` field instead.
pub fn init() {
    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_timer(Rfc3339)
                .with_target(false)
                .with_filter(level())
                .with_filter(FilterFn::new(|metadata| metadata.target() == "zetian")),
        )
        .init();
}

#[cfg(test)]
mod test {
    // The macros are exercised for expansion; no subscriber is installed,
    // so the events go nowhere
    #[test]
    fn macros_expand_with_and_without_levels() {
        crate::internal!("plain message");
        crate::internal!(level = DEBUG, "formatted {} message", 1);
        crate::incoming!("EHLO client.test");
        crate::outgoing!(level = INFO, "{} Ok", 250);
    }
}
