//! Process-wide tracing setup: stdout formatting plus an optional SQLite
//! mirror of warnings and errors.

mod logging;

pub use logging::{LogFilter, LogStore, PersistLayer, StoredEvent};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Used when `RUST_LOG` is unset.
    pub log_level: Level,
    pub overrides: Vec<(String, Level)>,
    pub json: bool,
    /// Where warnings are persisted; `None` keeps them on stdout only.
    pub event_db: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            overrides: Vec::new(),
            json: false,
            event_db: Some(data_dir().join("events.db")),
        }
    }
}

impl TelemetryConfig {
    fn directives(&self) -> Vec<String> {
        std::iter::once(self.log_level.as_str().to_ascii_lowercase())
            .chain(
                self.overrides
                    .iter()
                    .map(|(target, level)| format!("{target}={}", level.as_str().to_ascii_lowercase())),
            )
            .collect()
    }

    fn env_filter(&self) -> EnvFilter {
        if let Ok(from_env) = EnvFilter::try_from_default_env() {
            return from_env;
        }
        self.directives()
            .iter()
            .filter_map(|d| d.parse::<Directive>().ok())
            .fold(EnvFilter::default(), EnvFilter::add_directive)
    }
}

/// Returned by [`init_telemetry`]; holds the event store open for queries.
pub struct TelemetryGuard {
    events: Option<Arc<LogStore>>,
}

impl TelemetryGuard {
    pub fn events(&self) -> Option<&LogStore> {
        self.events.as_deref()
    }
}

/// Install the global subscriber.
pub fn try_init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TryInitError> {
    let filter = config.env_filter();
    let stdout = if config.json {
        fmt::layer().json().with_span_list(true).with_filter(filter).boxed()
    } else {
        fmt::layer().with_target(true).with_filter(filter).boxed()
    };

    let events = config.event_db.as_deref().and_then(|path| match LogStore::open(path) {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            eprintln!("parley-telemetry: event log disabled, {}: {err}", path.display());
            None
        }
    });

    tracing_subscriber::registry()
        .with(stdout)
        .with(events.clone().map(PersistLayer::new))
        .try_init()?;

    Ok(TelemetryGuard { events })
}

/// Like [`try_init_telemetry`], but a subscriber installed earlier wins.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    try_init_telemetry(config).unwrap_or(TelemetryGuard { events: None })
}

/// `$HOME/.parley`, falling back to the temp dir.
pub fn data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".parley")
}
