//! Tracing subscriber setup

use crate::settings::LoggingSettings;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global fmt subscriber.
///
/// `RUST_LOG` overrides the configured level. Returns false when a global
/// subscriber was already installed, which leaves the existing one in place.
pub fn init_logging(settings: &LoggingSettings) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(settings.show_target)
        .with_thread_ids(settings.show_thread_ids)
        .with_file(settings.show_location)
        .with_line_number(settings.show_location)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        let settings = LoggingSettings {
            level: "visitlens_engine=debug,warn".to_string(),
            ..LoggingSettings::default()
        };
        init_logging(&settings);
        assert!(!init_logging(&settings));
    }
}
