use super::{connection::Process, SipConnection};
use tokio::{select, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Something driven by a dedicated worker task
#[async_trait::async_trait]
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> String;
    async fn process(&self) -> Process;
    /// Runs once when the worker is cancelled
    async fn finish(&self);
}

#[async_trait::async_trait]
impl Worker for SipConnection {
    fn name(&self) -> String {
        self.id().to_string()
    }

    async fn process(&self) -> Process {
        SipConnection::process(self).await
    }

    async fn finish(&self) {
        match self {
            SipConnection::Stream(t) => {
                t.shutdown_flush().await;
                t.terminate("shutdown");
                t.process().await;
            }
            SipConnection::Udp(t) => {
                t.terminate("shutdown");
                t.process().await;
            }
        }
    }
}

/// Spawns the loop driving `worker` until it asks to terminate or `cancel` fires
///
/// `on_exit` runs exactly once after the loop ends, from the worker task.
pub fn spawn_worker<W, F>(worker: W, cancel: CancellationToken, on_exit: F) -> JoinHandle<()>
where
    W: Worker,
    F: FnOnce(&W) + Send + 'static,
{
    tokio::spawn(async move {
        let name = worker.name();
        debug!(name = %name, "worker started");
        loop {
            let process = select! {
                _ = cancel.cancelled() => {
                    worker.finish().await;
                    break;
                }
                process = worker.process() => process,
            };
            match process {
                Process::Continue => tokio::task::yield_now().await,
                Process::Sleep(delay) => {
                    select! {
                        _ = cancel.cancelled() => {
                            worker.finish().await;
                            break;
                        }
                        _ = sleep(delay) => {}
                    }
                }
                Process::Terminate => break,
            }
        }
        info!(name = %name, "worker exited");
        on_exit(&worker);
    })
}
