//! Stdio transport.
//!
//! Reads newline-delimited JSON-RPC from an input stream and writes one
//! encoded message per line to an output stream. By default these are the
//! process's stdin and stdout.
//!
//! The output stream carries protocol frames only. Diagnostics go through
//! `tracing`, which the binary points at stderr or a file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::protocol::{Codec, Frame, LineFramer, Message};

use super::traits::{ClosedSendPolicy, Transport, TransportEvent, TransportState};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 8 * 1024;
const EVENT_BUFFER: usize = 1024;

/// Line-delimited JSON-RPC over a pair of byte streams.
///
/// # Error Handling
///
/// - Malformed or oversized lines are logged and skipped; reading continues
/// - EOF on the input marks the transport `Disconnected`
/// - A broken pipe on the output stops the transport instead of failing
pub struct StdioTransport {
    reader: parking_lot::Mutex<Option<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    events_tx: parking_lot::Mutex<Option<mpsc::Sender<TransportEvent>>>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    codec: Codec,
    closed_send: ClosedSendPolicy,
}

impl StdioTransport {
    /// Transport over the process's stdin and stdout.
    pub fn new() -> Self {
        Self::with_streams(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Transport over arbitrary streams.
    pub fn with_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            reader: parking_lot::Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            events_tx: parking_lot::Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(events_rx),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            codec: Codec::default(),
            closed_send: ClosedSendPolicy::default(),
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_closed_send(mut self, policy: ClosedSendPolicy) -> Self {
        self.closed_send = policy;
        self
    }

    async fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line).await?;
        writer.flush().await
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("state", &self.state())
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (Some(reader), Some(tx)) = (self.reader.lock().take(), self.events_tx.lock().take())
        else {
            return Err(TransportError::AlreadyStarted);
        };

        self.connected.store(true, Ordering::SeqCst);
        tokio::spawn(read_loop(
            reader,
            tx,
            self.codec,
            Arc::clone(&self.connected),
            self.shutdown.clone(),
        ));
        debug!("Stdio transport started");
        Ok(())
    }

    async fn recv(&self) -> Option<TransportEvent> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await
    }

    async fn send(&self, message: &Message, _connection: Option<&str>) -> Result<(), TransportError> {
        if !self.is_connected() && self.shutdown.is_cancelled() {
            return self.closed_send.on_closed();
        }

        let line = self.codec.encode_line(message);
        match self.write_line(&line).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = TransportError::from(e);
                if err.is_disconnect() {
                    info!("Peer closed the output stream, stopping stdio transport");
                    self.stop().await
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);
        // never started: close the channel so recv() returns None
        self.events_tx.lock().take();
        debug!("Stdio transport stopped");
        Ok(())
    }

    fn state(&self) -> TransportState {
        if self.connected.load(Ordering::SeqCst) {
            TransportState::Connected
        } else {
            TransportState::Disconnected
        }
    }
}

async fn read_loop(
    mut reader: BoxedReader,
    tx: mpsc::Sender<TransportEvent>,
    codec: Codec,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut framer = LineFramer::new(codec.max_message_bytes());
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                if let Some(frame) = framer.finish() {
                    if !dispatch_frame(frame, &codec, &tx).await {
                        break;
                    }
                }
                info!("Input stream closed");
                break;
            }
            Ok(n) => {
                for frame in framer.push(&chunk[..n]) {
                    if !dispatch_frame(frame, &codec, &tx).await {
                        connected.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read input stream: {}", e);
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}

/// Decode one frame and forward it. Returns `false` once nobody is listening.
async fn dispatch_frame(frame: Frame, codec: &Codec, tx: &mpsc::Sender<TransportEvent>) -> bool {
    let line = match frame {
        Frame::Line(line) => line,
        Frame::Oversized => {
            warn!("Discarding oversized input line");
            return true;
        }
    };
    if line.trim_ascii().is_empty() {
        return true;
    }

    match codec.decode(&line) {
        Ok(message) => tx
            .send(TransportEvent::Message {
                message,
                connection_id: None,
            })
            .await
            .is_ok(),
        Err(e) => {
            warn!("Discarding malformed message: {}", e.reason());
            true
        }
    }
}
