use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{ControllerError, Result};
use crate::protocol::commands::{execute, RawRequest};
use crate::protocol::frame::{read_message, write_message};
use crate::protocol::Reply;
use crate::scheduler::Scheduler;

/// Accepts client connections, one request and reply per connection.
pub struct ProtocolServer {
    listener: TcpListener,
    scheduler: Arc<Scheduler>,
    request_timeout: Duration,
}

impl ProtocolServer {
    pub async fn bind(addr: SocketAddr, scheduler: Arc<Scheduler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let request_timeout = scheduler.config().request_timeout();
        Ok(Self {
            listener,
            scheduler,
            request_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let addr = self.listener.local_addr().ok();
        tracing::info!(addr = ?addr, "Protocol server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Protocol server shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let scheduler = self.scheduler.clone();
                    let timeout = self.request_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, scheduler, timeout).await {
                            tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    scheduler: Arc<Scheduler>,
    timeout: Duration,
) -> Result<()> {
    let payload = tokio::time::timeout(timeout, read_message(&mut stream))
        .await
        .map_err(|_| ControllerError::Protocol("timed out waiting for request".to_string()))?;

    let reply = match payload {
        Ok(payload) => match serde_json::from_slice::<RawRequest>(&payload) {
            Ok(request) => {
                let command = request.command.clone();
                let result = execute(&scheduler, request).await;
                if let Err(e) = &result {
                    tracing::info!(command = %command, kind = e.kind(), error = %e, "Command rejected");
                }
                Reply::from(result)
            }
            Err(e) => Reply::from(ControllerError::Protocol(format!("malformed request: {}", e))),
        },
        // Framing errors still get an answer if the socket is writable.
        Err(e @ ControllerError::Protocol(_)) => Reply::from(e),
        Err(e) => return Err(e),
    };

    let body = serde_json::to_vec(&reply)?;
    write_message(&mut stream, &body).await?;
    stream.shutdown().await?;
    Ok(())
}
