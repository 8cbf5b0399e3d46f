use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::http::connection::Connection;
use crate::proxy::Dispatcher;

/// Accepts connections until `shutdown` is cancelled. Each connection runs
/// on its own task registered with `tracker`.
pub async fn run(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Listening on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    // Usually transient (EMFILE); back off briefly.
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        debug!("Accepted connection from {}", peer);

        let dispatcher = Arc::clone(&dispatcher);
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let mut conn = Connection::new(socket, peer, dispatcher, shutdown);
            if let Err(e) = conn.run().await {
                debug!("Connection error from {}: {:#}", peer, e);
            }
        });
    }

    Ok(())
}
