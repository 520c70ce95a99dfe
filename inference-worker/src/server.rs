//! TCP accept loop, §4.9's "per TCP connection" entry point.

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::connection::{self, ConnectionConfig};
use crate::model::ModelPool;

/// Binds `host:port` and spawns one [`connection::handle`] task per
/// accepted socket, all sharing `pool`. Stops accepting once `shutdown_rx`
/// observes `true`, then awaits every in-flight connection task so each
/// one's session writer closes cleanly before returning (§5).
pub async fn run(
    host: String,
    port: u16,
    pool: ModelPool,
    config: ConnectionConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!(host, port, "inference worker listening");

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("shutdown requested, no longer accepting new connections");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                if let Err(err) = socket.set_nodelay(true) {
                    warn!(%err, "failed to set TCP_NODELAY");
                }
                info!(%peer, "accepted connection");

                let pool = pool.clone();
                let conn_config = config.clone();
                let conn_shutdown_rx = shutdown_rx.clone();
                connections.spawn(async move {
                    connection::handle(socket, pool, conn_config, conn_shutdown_rx).await;
                });
            }
        }
    }

    while connections.join_next().await.is_some() {}
    Ok(())
}
