//! Tracing setup for the terminal client
//!
//! Logs go to `<data dir>/logs/docchat.log` so they never interleave with
//! chat output. `--tracing` mirrors them to stderr as well.

use config::PathManager;
use std::fs::OpenOptions;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

const DEFAULT_FILTER: &str = "info,docchat_core=debug,docchat_api=info,docchat=debug";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// or buffered file output is lost.
pub fn init_logging(mirror_to_stderr: bool) -> Option<WorkerGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    if mirror_to_stderr {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_filter(filter())
                .boxed(),
        );
    }

    let guard = PathManager::log_file_path().and_then(|path| {
        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            eprintln!("[docchat] Failed to create log directory {:?}: {}", parent, e);
        }
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                layers.push(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_filter(filter())
                        .boxed(),
                );
                Some((path, guard))
            }
            Err(e) => {
                eprintln!("[docchat] Failed to open log file {:?}: {}", path, e);
                None
            }
        }
    });

    if let Err(e) = tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers)) {
        eprintln!("[docchat] Failed to set tracing subscriber: {}", e);
    }

    guard.map(|(path, guard)| {
        tracing::info!("Logging initialized, writing to {:?}", path);
        guard
    })
}
