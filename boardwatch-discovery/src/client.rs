//! Protocol client over a discovery tool's stdio.
//!
//! [`ProtocolClient`] owns the write half of the tool's stdin and a background
//! reader task over its stdout. The reader dispatches each decoded line by
//! kind: command replies complete the matching pending request, port events
//! and tool errors go to the currently attached [`EventSink`], and malformed
//! lines are logged, counted and skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::descriptor::DiscoveryId;
use crate::error::{SessionError, SessionResult};
use crate::port::DiscoveryEvent;
use crate::protocol::{
    COMMAND_ERROR_KIND, Command, CommandReply, DecodeError, DecodeTracker, DiscoveryMessage,
    decode_line,
};

/// Sender half of an event lane feeding an aggregator.
pub type EventSender = mpsc::UnboundedSender<DiscoveryEvent>;

type PendingReply = oneshot::Sender<Result<CommandReply, String>>;
type PendingTable = Arc<Mutex<HashMap<String, PendingReply>>>;

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// Swappable destination for a session's unsolicited events.
///
/// A reused session feeds a different consumer on every list or watch call;
/// events that arrive while nothing is attached are dropped.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    target: Arc<Mutex<Option<EventSender>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, tx: EventSender) {
        *self.target.lock() = Some(tx);
    }

    pub fn detach(&self) {
        self.target.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.target.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Forward an event. Returns `false` when it was dropped.
    pub fn send(&self, event: DiscoveryEvent) -> bool {
        match self.target.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Single-request-in-flight client with unsolicited event pushes.
pub struct ProtocolClient<W> {
    discovery: DiscoveryId,
    writer: W,
    pending: PendingTable,
    sink: EventSink,
    closed: Arc<AtomicBool>,
    quitting: Arc<AtomicBool>,
    health: Arc<Mutex<DecodeTracker>>,
    reader: JoinHandle<()>,
}

impl<W> ProtocolClient<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create a client and spawn its reader task on the current runtime.
    pub fn new<R>(discovery: DiscoveryId, writer: W, reader: R, tracker: DecodeTracker) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let sink = EventSink::new();
        let closed = Arc::new(AtomicBool::new(false));
        let quitting = Arc::new(AtomicBool::new(false));
        let health = Arc::new(Mutex::new(tracker));

        let reader = tokio::spawn(read_loop(ReaderState {
            discovery: discovery.clone(),
            pending: Arc::clone(&pending),
            sink: sink.clone(),
            closed: Arc::clone(&closed),
            quitting: Arc::clone(&quitting),
            health: Arc::clone(&health),
            reader: BufReader::new(reader),
        }));

        Self {
            discovery,
            writer,
            pending,
            sink,
            closed,
            quitting,
            health,
            reader,
        }
    }

    /// Send a command and wait for its correlated reply.
    ///
    /// The reply is returned as received; callers decide whether an error
    /// reply is fatal.
    ///
    /// # Errors
    /// [`SessionError::CommandTimeout`] if no reply arrives within `timeout`,
    /// [`SessionError::UnexpectedExit`] if the tool's output closes first, and
    /// [`SessionError::Io`] if the command cannot be written.
    pub async fn send(&mut self, command: &Command, timeout: Duration) -> SessionResult<CommandReply> {
        let kind = command.reply_kind();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(kind) {
                return Err(SessionError::InvalidState {
                    operation: "send",
                    state: format!("awaiting {kind} reply"),
                });
            }
            pending.insert(kind.to_string(), tx);
        }
        if self.is_closed() {
            self.pending.lock().remove(kind);
            return Err(SessionError::UnexpectedExit(
                "discovery closed its output".to_string(),
            ));
        }

        log::debug!("discovery {}: -> {}", self.discovery, command.name());
        if let Err(e) = self.write_line(&command.encode()).await {
            self.pending.lock().remove(kind);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(reason))) => Err(SessionError::UnexpectedExit(reason)),
            Ok(Err(_)) => Err(SessionError::UnexpectedExit(
                "reader stopped before replying".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(kind);
                Err(SessionError::CommandTimeout {
                    command: command.name().to_string(),
                    millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }

    /// Close the tool's stdin so it sees EOF.
    pub async fn close_input(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            log::debug!("discovery {}: closing stdin: {e}", self.discovery);
        }
    }

    /// Suppress the unexpected-exit event: the exit that follows was requested.
    pub fn mark_quitting(&self) {
        self.quitting.store(true, Ordering::SeqCst);
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// `true` once the tool's output reached EOF or failed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `false` once the decode failure threshold has been crossed.
    pub fn is_healthy(&self) -> bool {
        !self.health.lock().is_unhealthy()
    }

    /// Total malformed lines seen so far.
    pub fn decode_failures(&self) -> u64 {
        self.health.lock().total_failures()
    }
}

impl<W> Drop for ProtocolClient<W> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

struct ReaderState<R> {
    discovery: DiscoveryId,
    pending: PendingTable,
    sink: EventSink,
    closed: Arc<AtomicBool>,
    quitting: Arc<AtomicBool>,
    health: Arc<Mutex<DecodeTracker>>,
    reader: BufReader<R>,
}

async fn read_loop<R>(mut state: ReaderState<R>)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let exit_reason = loop {
        line.clear();
        match state.reader.read_line(&mut line).await {
            Ok(0) => break "discovery closed its output".to_string(),
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match decode_line(trimmed) {
                    Ok(mut message) => {
                        state.health.lock().record_success();
                        if let DiscoveryMessage::Reply(reply) = &mut message {
                            for e in std::mem::take(&mut reply.skipped) {
                                log::warn!(
                                    "discovery {}: dropping port from '{}' reply: {e}",
                                    state.discovery,
                                    reply.kind
                                );
                                record_decode_failure(&state, &e);
                            }
                        }
                        dispatch(&state, message);
                    }
                    Err(e) => {
                        log::warn!(
                            "discovery {}: skipping malformed line: {e}: {trimmed:?}",
                            state.discovery
                        );
                        record_decode_failure(&state, &e);
                    }
                }
            }
            Err(e) => break format!("error reading discovery output: {e}"),
        }
    };

    state.closed.store(true, Ordering::SeqCst);
    for (_, tx) in state.pending.lock().drain() {
        let _ = tx.send(Err(exit_reason.clone()));
    }

    if state.quitting.load(Ordering::SeqCst) {
        log::debug!("discovery {}: output closed after quit", state.discovery);
    } else {
        log::warn!("discovery {}: {exit_reason}", state.discovery);
        state.sink.send(DiscoveryEvent::Error {
            discovery: state.discovery.clone(),
            message: format!("process exited unexpectedly ({exit_reason})"),
        });
    }
}

/// Count a decode failure; crossing the threshold reports the session once.
fn record_decode_failure<R>(state: &ReaderState<R>, error: &DecodeError) {
    let tripped = state.health.lock().record_failure(Instant::now());
    if tripped {
        log::error!(
            "discovery {}: too many malformed lines, marking unhealthy",
            state.discovery
        );
        state.sink.send(DiscoveryEvent::Error {
            discovery: state.discovery.clone(),
            message: format!("unhealthy: repeated protocol errors ({error})"),
        });
    }
}

fn dispatch<R>(state: &ReaderState<R>, message: DiscoveryMessage) {
    match message {
        DiscoveryMessage::Reply(reply) => {
            let mut pending = state.pending.lock();
            let key = if reply.kind == COMMAND_ERROR_KIND {
                // Answers whatever is in flight.
                pending.keys().next().cloned()
            } else {
                Some(reply.kind.clone())
            };
            match key.and_then(|k| pending.remove(&k)) {
                Some(tx) => {
                    let _ = tx.send(Ok(reply));
                }
                None => log::warn!(
                    "discovery {}: dropping uncorrelated '{}' reply",
                    state.discovery,
                    reply.kind
                ),
            }
        }
        DiscoveryMessage::Added(port) => {
            log::debug!("discovery {}: add {}", state.discovery, port.key());
            state.sink.send(DiscoveryEvent::Added {
                discovery: state.discovery.clone(),
                port,
            });
        }
        DiscoveryMessage::Removed { protocol, address } => {
            log::debug!("discovery {}: remove {protocol}:{address}", state.discovery);
            state.sink.send(DiscoveryEvent::Removed {
                discovery: state.discovery.clone(),
                protocol,
                address,
            });
        }
        DiscoveryMessage::Failure(message) => {
            log::warn!("discovery {}: reported error: {message}", state.discovery);
            state.sink.send(DiscoveryEvent::Error {
                discovery: state.discovery.clone(),
                message,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
