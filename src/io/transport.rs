//! Floor-side link to the central coordinator
//!
//! `CoordinatorClient` keeps one TCP connection to central, reconnecting
//! after a delay whenever it drops. Requests are newline-JSON envelopes;
//! replies are matched back to callers by `msg_id`, so several lanes can
//! share the connection. A request that gets no reply within the request
//! timeout fails with `TransportFault::Timeout`, and every request still in
//! flight when the connection drops fails with `ConnectionLost`.

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::protocol::{
    decode_line, encode_line, AdminAck, AdminCommand, AuthorizationResponse, Envelope,
    EventSubmission, Message, Statistics,
};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFault {
    #[error("not connected to central")]
    NotConnected,
    #[error("connection to central lost")]
    ConnectionLost,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("could not encode request: {0}")]
    Encode(String),
    #[error("central rejected request: {0}")]
    Rejected(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// What a lane needs from central
#[async_trait]
pub trait CentralLink: Send + Sync {
    /// Submit one event and wait for the decision
    async fn submit(&self, submission: EventSubmission) -> Result<AuthorizationResponse, TransportFault>;

    async fn statistics(&self) -> Result<Statistics, TransportFault>;
}

/// Log connection failure (cold path)
#[cold]
fn log_connect_failed(addr: &str, error: &str) {
    error!(addr = %addr, error = %error, "transport_connect_failed");
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub addr: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            addr: config.central_addr(),
            connect_timeout: Duration::from_millis(config.central_connect_timeout_ms()),
            request_timeout: Duration::from_millis(config.central_request_timeout_ms()),
            reconnect_delay: Duration::from_millis(config.central_reconnect_delay_ms()),
        }
    }
}

type PendingReplies = Arc<SyncMutex<FxHashMap<u64, oneshot::Sender<Message>>>>;

/// One encoded request waiting for the writer
struct Outbound {
    msg_id: u64,
    line: String,
}

pub struct CoordinatorClient {
    settings: ClientSettings,
    next_msg_id: AtomicU64,
    pending: PendingReplies,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Outbound>>>,
    connected_tx: watch::Sender<bool>,
    metrics: Option<Arc<Metrics>>,
}

impl CoordinatorClient {
    pub fn new(settings: ClientSettings) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (connected_tx, _) = watch::channel(false);
        Self {
            settings,
            next_msg_id: AtomicU64::new(1),
            pending: Arc::new(SyncMutex::new(FxHashMap::default())),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            connected_tx,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// Wait until the connection is up, or give up after `limit`
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let mut rx = self.connected_tx.subscribe();
        let up = matches!(tokio::time::timeout(limit, rx.wait_for(|up| *up)).await, Ok(Ok(_)));
        up
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    async fn connect(&self) -> Result<TcpStream, String> {
        let stream =
            match tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(&self.settings.addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => return Err(format!("connect timed out after {:?}", self.settings.connect_timeout)),
            };
        // Small frames, latency matters more than throughput
        stream.set_nodelay(true).map_err(|e| e.to_string())?;
        Ok(stream)
    }

    /// Connection loop; returns when `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let stream = match self.connect().await {
                Ok(stream) => stream,
                Err(e) => {
                    log_connect_failed(&self.settings.addr, &e);
                    if self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            info!(addr = %self.settings.addr, "transport_connected");

            let (read_half, write_half) = tokio::io::split(stream);
            let mut read_handle = tokio::spawn(Self::read_loop(read_half, self.pending.clone()));
            let mut write_handle =
                tokio::spawn(Self::write_loop(write_half, self.outbound_rx.clone(), self.pending.clone()));
            self.connected_tx.send_replace(true);

            let stop = tokio::select! {
                _ = &mut read_handle => {
                    warn!("transport_read_loop_exited");
                    false
                }
                _ = &mut write_handle => {
                    warn!("transport_write_loop_exited");
                    false
                }
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };

            read_handle.abort();
            write_handle.abort();
            // The writer holds the outbound queue until it has really stopped
            if !write_handle.is_finished() {
                let _ = write_handle.await;
            }
            self.connected_tx.send_replace(false);
            self.fail_pending();

            if stop || self.pause(&mut shutdown).await {
                break;
            }
        }
        self.connected_tx.send_replace(false);
        info!("transport_shutdown");
    }

    /// Sleep for the reconnect delay. Returns true if shutdown was requested.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.reconnect_delay) => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }

    /// Dropping the senders wakes every waiter with `ConnectionLost`
    fn fail_pending(&self) {
        let failed = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if failed > 0 {
            warn!(requests = failed, "transport_pending_failed");
        }
        // Lines queued for the dead connection must not reach the next one
        if let Ok(mut rx) = self.outbound_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }

    async fn read_loop(read_half: ReadHalf<TcpStream>, pending: PendingReplies) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    warn!("transport_connection_closed");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "transport_read_error");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let envelope = match decode_line(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, line = %line, "transport_reply_malformed");
                    continue;
                }
            };

            let waiter = pending.lock().remove(&envelope.msg_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(envelope.body);
                }
                None => debug!(msg_id = envelope.msg_id, "transport_reply_unmatched"),
            }
        }
    }

    /// Requests whose caller already gave up are dropped, never sent late
    async fn write_loop(
        mut write_half: WriteHalf<TcpStream>,
        outbound_rx: Arc<Mutex<mpsc::Receiver<Outbound>>>,
        pending: PendingReplies,
    ) {
        let mut outbound = outbound_rx.lock().await;
        while let Some(Outbound { msg_id, line }) = outbound.recv().await {
            if !pending.lock().contains_key(&msg_id) {
                debug!(msg_id, "transport_abandoned_request_dropped");
                continue;
            }
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                error!(error = %e, "transport_write_error");
                return;
            }
        }
    }

    /// Send one request and wait for the reply with the same `msg_id`
    pub async fn request(&self, body: Message) -> Result<Message, TransportFault> {
        let result = self.request_inner(body).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_transport_request(result.is_ok());
        }
        result
    }

    async fn request_inner(&self, body: Message) -> Result<Message, TransportFault> {
        if !self.is_connected() {
            return Err(TransportFault::NotConnected);
        }

        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let kind = body.type_name();
        let line = encode_line(&Envelope { msg_id, body }).map_err(|e| TransportFault::Encode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(msg_id, tx);

        let timeout = self.settings.request_timeout;
        let exchange = async {
            self.outbound_tx.send(Outbound { msg_id, line }).await.map_err(|_| TransportFault::ConnectionLost)?;
            rx.await.map_err(|_| TransportFault::ConnectionLost)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(fault)) => {
                self.pending.lock().remove(&msg_id);
                warn!(msg_id, kind, fault = %fault, "transport_request_failed");
                Err(fault)
            }
            Err(_) => {
                self.pending.lock().remove(&msg_id);
                warn!(msg_id, kind, timeout_ms = timeout.as_millis() as u64, "transport_request_timeout");
                Err(TransportFault::Timeout(timeout))
            }
        }
    }

    pub async fn admin(&self, command: AdminCommand) -> Result<AdminAck, TransportFault> {
        match self.request(Message::AdminCommand(command)).await? {
            Message::AdminAck(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Message) -> TransportFault {
    match reply {
        Message::Error { detail } => TransportFault::Rejected(detail),
        other => TransportFault::UnexpectedReply(other.type_name().to_string()),
    }
}

#[async_trait]
impl CentralLink for CoordinatorClient {
    async fn submit(&self, submission: EventSubmission) -> Result<AuthorizationResponse, TransportFault> {
        match self.request(Message::EventSubmission(submission)).await? {
            Message::AuthorizationResponse(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn statistics(&self) -> Result<Statistics, TransportFault> {
        match self.request(Message::StatisticsQuery).await? {
            Message::StatisticsReply(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }
}
