/// Log sink setup: every record goes to stderr and is appended to the
/// configured log file.
///
/// The file writer sits behind a `Mutex`. The fmt layer renders each event
/// into one buffer before writing, so concurrent escalation tasks never
/// interleave partial lines.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "passenger_monitor=info";
const VERBOSE_FILTER: &str = "passenger_monitor=debug";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(log_file: &Path, verbose: bool) -> Result<(), LogError> {
    let file = open_log_file(log_file)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));

    build_subscriber(std::io::stderr.and(Mutex::new(file)), filter)
        .try_init()
        .map_err(|e| LogError::Init {
            detail: e.to_string(),
        })
}

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })
}

/// Open the log file for appending, creating it if needed.
pub fn open_log_file(path: &Path) -> Result<File, LogError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LogError::Open {
            path: path.to_path_buf(),
            source: e,
        })
}

fn build_subscriber<W>(writer: W, filter: EnvFilter) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(writer)
        .finish()
}

#[derive(Debug)]
pub enum LogError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A global subscriber was already installed.
    Init { detail: String },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Open { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
            LogError::Init { detail } => write!(f, "failed to initialize logging: {detail}"),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::Open { source, .. } => Some(source),
            LogError::Init { .. } => None,
        }
    }
}
