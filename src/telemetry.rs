use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::CacheError;
use crate::error::Result;

/// Install a global subscriber filtered by `RUST_LOG`. Events and span lifecycles go to `log_file` when given,
/// truncating it, or to stdout otherwise.
pub fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let dest_writer = Mutex::new(if let Some(log_file) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log_file)
            .map_err(|err| CacheError::config(format!("cannot open log file {}: {err}", log_file.display())))?;
        Box::new(file) as Box<dyn io::Write + Send>
    }
    else {
        Box::new(io::stdout()) as Box<dyn io::Write + Send>
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(dest_writer)
                .with_span_events(FmtSpan::FULL),
        )
        .try_init()
        .map_err(|err| CacheError::config(format!("tracing already initialized: {err}")))?;

    info!("Tracing initialized");
    Ok(())
}
