//! TCP listener: accepts operator connections and runs one independent
//! session task per connection until shutdown.

pub mod connection;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::ModelProvider;
use crate::session::SessionSettings;

/// Read-only state shared by every connection.
pub struct Shared {
    pub settings: Arc<SessionSettings>,
    pub provider: Arc<dyn ModelProvider>,
    /// Offer WILL ECHO / WILL SGA on connect.
    pub negotiate: bool,
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    pub async fn bind(addr: &str, shared: Shared) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self {
            listener,
            shared: Arc::new(shared),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    /// Accept connections until `cancel` fires, then wait for every open
    /// session to wind down.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let bound = self.local_addr()?;
        info!(%bound, "terminal server listening");

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "connection accepted");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "set_nodelay failed");
                        }
                        sessions.spawn(connection::handle_connection(
                            stream,
                            peer,
                            self.shared.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "session task panicked");
                    }
                }
            }
        }

        if !sessions.is_empty() {
            info!(open = sessions.len(), "closing open sessions");
        }
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "session task panicked");
            }
        }
        info!("terminal server stopped");
        Ok(())
    }
}
