//! Network Server
//!
//! TCP server answering framed requests from peer nodes.

use std::sync::Arc;
use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};

use super::{read_message, write_message};
use crate::replication::Message;
use crate::error::{Error, Result};

/// Message handler callback type. `None` sends no reply.
pub type MessageHandler =
    Arc<dyn Fn(String, Message) -> BoxFuture<'static, Option<Message>> + Send + Sync>;

/// Network server for peer communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Message handler
    handler: MessageHandler,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, handler: MessageHandler) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Network server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = self.handler.clone();
                            let shutdown_rx = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), handler, shutdown_rx).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    handler: MessageHandler,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = tokio::select! {
            result = read_message(&mut reader) => result,
            _ = shutdown_rx.changed() => break,
        };

        match message {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

                if let Some(response) = handler(peer_addr.clone(), message).await {
                    write_message(&mut writer, &response).await?;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message: {}", e);
                break;
            }
        }
    }

    Ok(())
}
