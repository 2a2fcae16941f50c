use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{Framed, LinesCodec};

use crate::server::commands::execute_command;
use crate::server::notify::Watches;
use crate::server::protocol::{MAX_LINE_LENGTH, exception_message, parse_request, return_message};
use crate::server::state::ServerState;

/// Accepts clients until the task is cancelled.
pub async fn handle_client_connections(listener: TcpListener, state: ServerState) {
    loop {
        match listener.accept().await {
            Ok((socket, address)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(error) = handle_client(socket, address, state).await {
                        log::warn!("Client {address} error: {error}");
                    }
                });
            }
            Err(error) => {
                log::error!("Cannot accept client connection: {error}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    address: SocketAddr,
    state: ServerState,
) -> crate::Result<()> {
    log::debug!("New client connection from {address}");
    let host = address.ip().to_string();
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut changes = state.subscribe();
    let mut watches = Watches::default();

    loop {
        tokio::select! {
            line = framed.next() => {
                let Some(line) = line else {
                    break;
                };
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let result = parse_request(&line).and_then(|request| {
                    execute_command(state.controller(), &mut watches, &request, &host)
                });
                state.signal_changes();
                match result {
                    Ok(value) => framed.send(return_message(value)?).await?,
                    Err(error) => {
                        log::warn!("Bad request from {address}: {error}");
                        framed.send(exception_message(&error.to_string())?).await?;
                        break;
                    }
                }
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    for message in watches.notifications(&change)? {
                        framed.send(message).await?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Client {address} missed {skipped} change notifications");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    log::debug!("Client {address} disconnected");
    Ok(())
}
