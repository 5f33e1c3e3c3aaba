//! Logging pipeline
//!
//! Events are formatted on the calling thread and handed to a background
//! writer. When the writer falls behind, new lines are dropped instead of
//! blocking request handling.

use std::time::Duration;

use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Lines buffered before the writer starts dropping
const BUFFERED_LINES: usize = 512;

/// Owner of the background log writer.
///
/// Keep it alive for the life of the process and call
/// [`LogPipeline::drain`] on the way out; dropping it flushes as well, but
/// without a bound on how long that takes.
#[must_use = "dropping the pipeline stops log delivery"]
#[derive(Debug)]
pub struct LogPipeline {
    guard: WorkerGuard,
}

impl LogPipeline {
    /// Flush buffered lines and stop the writer, waiting at most `timeout`.
    ///
    /// Returns `false` when the writer did not finish in time.
    pub async fn drain(self, timeout: Duration) -> bool {
        let guard = self.guard;
        let flush = tokio::task::spawn_blocking(move || drop(guard));
        matches!(tokio::time::timeout(timeout, flush).await, Ok(Ok(())))
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. `format` may be `"json"`;
/// anything else selects the human-readable format.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<LogPipeline> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard) = NonBlockingBuilder::default()
        .buffered_lines_limit(BUFFERED_LINES)
        .lossy(true)
        .finish(std::io::stdout());

    let subscriber = tracing_subscriber::registry().with(filter);
    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(writer))
            .try_init(),
        _ => subscriber.with(fmt::layer().with_writer(writer)).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("failed to install log subscriber: {e}")))?;

    Ok(LogPipeline { guard })
}
