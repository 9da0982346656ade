//! Global subscriber setup for pursuit binaries.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Variable naming a file that receives a Chrome trace of the run.
pub const CHROME_TRACE_ENV: &str = "PURSUIT_TRACE_CHROME";

/// Filter used when `RUST_LOG` is unset. Replay and library loading log per
/// file at `debug`, which is too chatty for a default.
pub const DEFAULT_FILTER: &str = "info";

static INITIALISED: OnceLock<()> = OnceLock::new();
static CHROME_GUARD: Mutex<Option<tracing_chrome::FlushGuard>> = Mutex::new(None);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracingOptions {
    /// Directive applied when `RUST_LOG` is absent or unparsable.
    pub default_filter: String,
    pub chrome_trace: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            default_filter: DEFAULT_FILTER.to_string(),
            chrome_trace: None,
            ansi: false,
        }
    }
}

impl TracingOptions {
    /// Reads [`CHROME_TRACE_ENV`] and colours output only on a terminal.
    pub fn from_env() -> Result<Self, InitError> {
        let chrome_trace = match std::env::var(CHROME_TRACE_ENV) {
            Ok(raw) => parse_trace_path(&raw),
            Err(std::env::VarError::NotPresent) => None,
            Err(err) => return Err(InitError::Env(err)),
        };
        Ok(Self {
            chrome_trace,
            ansi: std::io::stderr().is_terminal(),
            ..Self::default()
        })
    }

    pub fn with_default_filter(mut self, directive: impl Into<String>) -> Self {
        self.default_filter = directive.into();
        self
    }
}

fn parse_trace_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| PathBuf::from(raw))
}

/// Installs the subscriber described by the environment.
pub fn init_tracing() -> Result<(), InitError> {
    init_with(TracingOptions::from_env()?)
}

/// Installs a stderr formatter filtered by `RUST_LOG`, plus a Chrome trace
/// writer when `options.chrome_trace` is set. Only the first call succeeds.
pub fn init_with(options: TracingOptions) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(options.ansi)
        .with_writer(std::io::stderr);

    match options.chrome_trace {
        Some(path) => {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(path)
                .include_args(true)
                .build();
            if let Ok(mut slot) = CHROME_GUARD.lock() {
                *slot = Some(guard);
            }
            Registry::default()
                .with(filter)
                .with(fmt_layer)
                .with(chrome_layer)
                .try_init()?;
        }
        None => Registry::default().with(filter).with(fmt_layer).try_init()?,
    }
    Ok(())
}

/// Flushes the Chrome trace, if any. Call once before the process exits.
pub fn flush_chrome_trace() {
    if let Ok(mut slot) = CHROME_GUARD.lock() {
        slot.take();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to read {CHROME_TRACE_ENV}: {0}")]
    Env(std::env::VarError),
    #[error("another global subscriber is installed: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
