//! Signal handling and orderly shutdown

use std::time::Duration;

use discovery_network::{Host, Shutdown, ShutdownState};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{DaemonError, Result};

/// How long background tasks get to finish after the host is closed
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// SIGINT and SIGTERM as a stream of unit events
#[cfg(unix)]
pub fn termination_signals() -> Result<BoxStream<'static, ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let interrupt = signal(SignalKind::interrupt())?;
    let terminate = signal(SignalKind::terminate())?;

    let signals = stream::unfold((interrupt, terminate), |(mut interrupt, mut terminate)| async move {
        let received = tokio::select! {
            s = interrupt.recv() => s,
            s = terminate.recv() => s,
        };
        received.map(|()| ((), (interrupt, terminate)))
    });
    Ok(signals.boxed())
}

/// Ctrl-C as a stream of unit events
#[cfg(not(unix))]
pub fn termination_signals() -> Result<BoxStream<'static, ()>> {
    let signals = stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok().map(|()| ((), ()))
    });
    Ok(signals.boxed())
}

/// Drives a node from `Running` through `Closing` to `Terminated`.
///
/// The first signal makes cancellation visible to every task, closes the
/// host and waits up to the grace period for the tasks to finish; stragglers
/// are aborted. A second signal while closing aborts everything at once and
/// reports [`DaemonError::ForcedShutdown`].
pub struct ShutdownController {
    shutdown: Shutdown,
    host: Host,
    tasks: Vec<JoinHandle<()>>,
    grace_period: Duration,
}

impl ShutdownController {
    pub fn new(shutdown: Shutdown, host: Host, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            shutdown,
            host,
            tasks,
            grace_period: SHUTDOWN_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn state(&self) -> ShutdownState {
        self.shutdown.state()
    }

    /// Wait for the first signal, then shut down.
    ///
    /// A signal stream that ends before yielding counts as a shutdown
    /// request.
    pub async fn run<S>(&mut self, mut signals: S) -> Result<()>
    where
        S: Stream<Item = ()> + Unpin,
    {
        if signals.next().await.is_none() {
            debug!("Signal stream ended, shutting down");
        }
        if !self.shutdown.trigger() {
            return Ok(());
        }

        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

        let host = &self.host;
        let grace_period = self.grace_period;
        let graceful = async {
            if let Err(e) = host.close().await {
                warn!("Failed to close host: {}", e);
            }
            let drain = futures::future::join_all(tasks);
            if tokio::time::timeout(grace_period, drain).await.is_err() {
                warn!(
                    "Background tasks still running after {:?}, aborting",
                    grace_period
                );
                for abort in &aborts {
                    abort.abort();
                }
            }
        };

        tokio::select! {
            _ = graceful => {}
            _ = next_signal(&mut signals) => {
                warn!("Second signal received, forcing shutdown");
                for abort in &aborts {
                    abort.abort();
                }
                self.shutdown.terminate();
                return Err(DaemonError::ForcedShutdown);
            }
        }

        info!("Received signal, shutting down...");
        self.shutdown.terminate();
        Ok(())
    }
}

/// Resolves on the next signal; never resolves once the stream has ended
async fn next_signal<S>(signals: &mut S)
where
    S: Stream<Item = ()> + Unpin,
{
    if signals.next().await.is_none() {
        futures::future::pending::<()>().await;
    }
}
