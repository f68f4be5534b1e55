//! Tracing subscriber setup for the binary.
//!
//! The library itself only emits through the crate-internal `log_*!` macros;
//! installing a subscriber is the host's job.

use tracing_subscriber::{
    // ---
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LogSettings;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `settings.level` when set. Calling this twice is
/// harmless; the second call leaves the first subscriber in place.
pub fn init(settings: &LogSettings) {
    // ---
    let filter = filter_for(settings);

    let installed = if settings.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn filter_for(settings: &LogSettings) -> EnvFilter {
    // ---
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        let settings = LogSettings::default();
        init(&settings);
        init(&settings);
    }
}
