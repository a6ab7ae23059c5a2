use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "MESH_LOG_FILTER";
const TRACE_DEPS_ENV: &str = "MESH_TRACE_DEPS";

/// Targets that drown the mesh's own output at trace level.
const NOISY_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_mdns",
    "tungstenite",
    "tokio_tungstenite",
];

const MESH_TARGETS: &[&str] = &["mesh", "mesh_peers", "mesh_proto"];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Log to this file instead of stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let directives = std::env::var(FILTER_ENV).unwrap_or_else(|_| {
        let keep_deps = std::env::var(TRACE_DEPS_ENV).is_ok_and(|v| !v.is_empty() && v != "0");
        directives_for(config.level, keep_deps)
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let _ = GUARD.set(guard);
    Ok(())
}

/// Verbose levels apply only to the mesh's own targets; everything else stays
/// at info. At trace, dependency chatter is capped unless `keep_deps`.
fn directives_for(level: LogLevel, keep_deps: bool) -> String {
    let own = match level {
        LogLevel::Error => return "error".into(),
        LogLevel::Warn => return "warn".into(),
        LogLevel::Info => return "info".into(),
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let mut directives = vec!["info".to_string()];
    directives.extend(MESH_TARGETS.iter().map(|target| format!("{target}={own}")));
    if level == LogLevel::Trace && !keep_deps {
        directives.extend(NOISY_TARGETS.iter().map(|target| format!("{target}=info")));
    }
    directives.join(",")
}
