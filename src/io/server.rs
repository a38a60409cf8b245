//! Central-side TCP listener
//!
//! One task per floor connection. Lines on a connection are handled in
//! order; the coordinator call runs on the blocking pool since it takes
//! plate locks and may append to the journal.

use crate::infra::config::Config;
use crate::io::protocol::{decode_line, encode_line, salvage_msg_id, Envelope, Message};
use crate::services::coordinator::Coordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Bind the coordinator listener on `[central] bind_address:port`
pub async fn bind(config: &Config) -> std::io::Result<TcpListener> {
    let addr = format!("{}:{}", config.central_bind_address(), config.central_port());
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "coordinator_listener_started");
    Ok(listener)
}

/// Accept floor connections until shutdown
pub async fn serve(listener: TcpListener, coordinator: Arc<Coordinator>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("coordinator_listener_shutdown");
                    return;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        let coordinator = coordinator.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(socket, peer, coordinator, shutdown).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "coordinator_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = socket.set_nodelay(true);
    let clients = coordinator.client_connected();
    info!(peer = %peer, clients, "coordinator_client_connected");

    let (read_half, mut write_half) = tokio::io::split(socket);
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            next = lines.next_line() => match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "coordinator_read_error");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = respond(&coordinator, &line).await;
        let encoded = match encode_line(&reply) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(peer = %peer, error = %e, "coordinator_reply_encode_failed");
                continue;
            }
        };
        if let Err(e) = write_half.write_all(encoded.as_bytes()).await {
            warn!(peer = %peer, error = %e, "coordinator_write_error");
            break;
        }
    }

    let clients = coordinator.client_disconnected();
    info!(peer = %peer, clients, "coordinator_client_disconnected");
}

/// Answer one request line. Replies always carry the request's `msg_id`.
pub async fn respond(coordinator: &Arc<Coordinator>, line: &str) -> Envelope {
    let request = match decode_line(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "coordinator_request_malformed");
            return Envelope {
                msg_id: salvage_msg_id(line),
                body: Message::Error { detail: format!("malformed request: {e}") },
            };
        }
    };
    debug!(msg_id = request.msg_id, kind = request.body.type_name(), "coordinator_request_received");

    let body = match request.body {
        Message::EventSubmission(submission) => {
            let coordinator = coordinator.clone();
            match tokio::task::spawn_blocking(move || coordinator.handle_event(submission.into())).await {
                Ok(response) => Message::AuthorizationResponse(response),
                Err(e) => {
                    error!(error = %e, "coordinator_handler_panicked");
                    Message::Error { detail: "event handling failed".to_string() }
                }
            }
        }
        Message::StatisticsQuery => Message::StatisticsReply(coordinator.get_statistics()),
        Message::AdminCommand(command) => Message::AdminAck(coordinator.apply_admin(&command)),
        other => Message::Error { detail: format!("unexpected message type {}", other.type_name()) },
    };
    Envelope { msg_id: request.msg_id, body }
}
