//! Terminal relay pump.
//!
//! Moves bytes between one [`TerminalProcess`] and one framed duplex stream
//! until either side ends. Two directions run concurrently under a shared
//! [`CancellationToken`]:
//!
//! - outbound: a blocking reader drains the process in fixed-size chunks
//!   into a bounded channel; each chunk becomes one output message.
//! - inbound: messages are decoded into input, resize or keepalive and
//!   applied to the process in arrival order.
//!
//! Teardown is ordered: both directions return, the reader thread is joined,
//! the process is closed, the stream is shut down, and only then is the
//! owner told via [`SessionEvents::session_ended`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use termrelay_protocol::{InboundFrame, MessageCodec, OutboundFrame, ProtocolError, WindowSize};
use termrelay_pty::{PtyError, ReadStatus, TerminalProcess};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{RelayConfig, DEFAULT_KEEPALIVE_SECS, DEFAULT_READ_CHUNK_SIZE};
use crate::error::RelayError;
use crate::recording::RecordingSink;
use crate::session::{CloseReason, SessionId};

const READ_POLL: Duration = Duration::from_millis(100);
const OUTPUT_QUEUE_DEPTH: usize = 16;

/// Callbacks from a running relay to the owner of the session record.
///
/// The relay never mutates session state itself.
pub trait SessionEvents: Send + Sync + 'static {
    /// Traffic was seen in either direction.
    fn touch(&self, session_id: &SessionId);

    /// The process accepted a new window size.
    fn resized(&self, session_id: &SessionId, size: WindowSize);

    /// The relay has fully torn down. Called exactly once per run.
    fn session_ended(&self, session_id: &SessionId, reason: CloseReason);
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub read_chunk_size: usize,
    pub keepalive_interval: Duration,
    /// Inbound silence (keepalives included) after which the stream is dead.
    pub idle_read_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        let keepalive_interval = Duration::from_secs(DEFAULT_KEEPALIVE_SECS);
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            keepalive_interval,
            idle_read_timeout: keepalive_interval * 3,
            max_frame_bytes: termrelay_protocol::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl RelayOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            read_chunk_size: config.read_chunk_size,
            keepalive_interval: config.keepalive_interval,
            idle_read_timeout: config.idle_read_timeout(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub reason: CloseReason,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_dropped: u64,
}

enum ProcessOutput {
    Data(Bytes),
    Eof,
    Failed(String),
}

#[derive(Debug)]
enum SendError {
    Cancelled,
    Failed(String),
}

pub struct RelayPump<P: TerminalProcess, E: SessionEvents> {
    session_id: SessionId,
    process: Arc<P>,
    events: Arc<E>,
    cancel: CancellationToken,
    options: RelayOptions,
    recorder: Option<Box<dyn RecordingSink>>,
}

impl<P: TerminalProcess, E: SessionEvents> RelayPump<P, E> {
    pub fn new(
        session_id: SessionId,
        process: Arc<P>,
        events: Arc<E>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            process,
            events,
            cancel,
            options: RelayOptions::default(),
            recorder: None,
        }
    }

    pub fn with_options(mut self, options: RelayOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_recorder(mut self, recorder: Box<dyn RecordingSink>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Frames `stream` with the configured message limit and runs the relay.
    pub async fn run_stream<S>(self, stream: S) -> RelayOutcome
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = MessageCodec::new(self.options.max_frame_bytes);
        self.run(Framed::new(stream, codec)).await
    }

    /// Runs until the process exits, the stream fails or closes, or the
    /// token is cancelled.
    ///
    /// Takes an already framed stream so messages buffered behind the
    /// preamble are not lost.
    pub async fn run<S>(self, framed: Framed<S, MessageCodec>) -> RelayOutcome
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let RelayPump {
            session_id,
            process,
            events,
            cancel,
            options,
            mut recorder,
        } = self;

        let (mut outbound, mut inbound) = framed.split();

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let reader = spawn_reader(
            Arc::clone(&process),
            tx,
            cancel.clone(),
            options.read_chunk_size,
        );

        let relay = Relay {
            session_id: &session_id,
            process: &process,
            events: &events,
            cancel: &cancel,
            options: &options,
        };

        let mut bytes_in = 0u64;
        let mut bytes_out = 0u64;
        let mut frames_dropped = 0u64;
        let (outbound_reason, inbound_reason) = tokio::join!(
            relay.pump_outbound(rx, &mut outbound, &mut recorder, &mut bytes_out),
            relay.pump_inbound(&mut inbound, &mut bytes_in, &mut frames_dropped),
        );

        cancel.cancel();
        if let Err(e) = reader.await {
            warn!(session_id = %session_id, error = %e, "PTY reader task failed");
        }

        let closer = Arc::clone(&process);
        match tokio::task::spawn_blocking(move || closer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %session_id, error = %e, "Failed to close process"),
            Err(e) => warn!(session_id = %session_id, error = %e, "Process close task failed"),
        }

        if let Some(mut sink) = recorder.take() {
            if let Err(e) = sink.finish() {
                warn!(session_id = %session_id, error = %e, "Failed to finish recording");
            }
        }

        if let Err(e) = outbound.close().await {
            debug!(session_id = %session_id, error = %e, "Stream shutdown failed");
        }

        let reason = outbound_reason
            .or(inbound_reason)
            .unwrap_or_else(|| CloseReason::Requested("session closed".to_string()));

        info!(
            session_id = %session_id,
            reason = %reason,
            bytes_in,
            bytes_out,
            frames_dropped,
            "Relay finished"
        );
        events.session_ended(&session_id, reason.clone());

        RelayOutcome {
            reason,
            bytes_in,
            bytes_out,
            frames_dropped,
        }
    }
}

/// Blocking PTY reader. Exits on EOF, read error, cancellation, or when the
/// outbound side stops receiving.
fn spawn_reader<P: TerminalProcess>(
    process: Arc<P>,
    tx: mpsc::Sender<ProcessOutput>,
    cancel: CancellationToken,
    chunk_size: usize,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; chunk_size];
        while !cancel.is_cancelled() {
            let output = match process.read(&mut buf, READ_POLL) {
                Ok(ReadStatus::Data(n)) => ProcessOutput::Data(Bytes::copy_from_slice(&buf[..n])),
                Ok(ReadStatus::Idle) => continue,
                Ok(ReadStatus::Eof) => ProcessOutput::Eof,
                Err(e) => ProcessOutput::Failed(e.to_string()),
            };
            let last = !matches!(output, ProcessOutput::Data(_));
            if tx.blocking_send(output).is_err() || last {
                break;
            }
        }
    })
}

/// Borrowed view shared by both directions.
struct Relay<'a, P, E> {
    session_id: &'a SessionId,
    process: &'a Arc<P>,
    events: &'a Arc<E>,
    cancel: &'a CancellationToken,
    options: &'a RelayOptions,
}

impl<P: TerminalProcess, E: SessionEvents> Relay<'_, P, E> {
    /// Returns `None` when stopped by cancellation from elsewhere.
    async fn pump_outbound<K>(
        &self,
        mut rx: mpsc::Receiver<ProcessOutput>,
        sink: &mut K,
        recorder: &mut Option<Box<dyn RecordingSink>>,
        bytes_out: &mut u64,
    ) -> Option<CloseReason>
    where
        K: Sink<Bytes, Error = ProtocolError> + Unpin,
    {
        let period = self.options.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                output = rx.recv() => match output {
                    Some(ProcessOutput::Data(chunk)) => {
                        self.events.touch(self.session_id);
                        self.record(recorder, &chunk);
                        *bytes_out += chunk.len() as u64;
                        OutboundFrame::Output(chunk)
                    }
                    Some(ProcessOutput::Failed(reason)) => {
                        warn!(session_id = %self.session_id, error = %reason, "PTY read failed");
                        let notice = Bytes::from(format!("\r\n{}\r\n", reason));
                        if let Err(e) = self.send(sink, OutboundFrame::Output(notice)).await {
                            debug!(session_id = %self.session_id, error = ?e, "Failure notice not delivered");
                        }
                        self.cancel.cancel();
                        return Some(CloseReason::ProcessExited);
                    }
                    Some(ProcessOutput::Eof) | None => {
                        debug!(session_id = %self.session_id, "Process output ended");
                        self.cancel.cancel();
                        return Some(CloseReason::ProcessExited);
                    }
                },
                _ = keepalive.tick() => OutboundFrame::Keepalive,
            };

            match self.send(sink, frame).await {
                Ok(()) => {}
                Err(SendError::Cancelled) => return None,
                Err(SendError::Failed(reason)) => {
                    warn!(session_id = %self.session_id, error = %reason, "Outbound send failed");
                    return Some(self.fail(RelayError::Stream(reason)));
                }
            }
        }
    }

    /// A send that outlives the idle timeout counts as a dead stream.
    async fn send<K>(&self, sink: &mut K, frame: OutboundFrame) -> Result<(), SendError>
    where
        K: Sink<Bytes, Error = ProtocolError> + Unpin,
    {
        let limit = self.options.idle_read_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SendError::Cancelled),
            sent = tokio::time::timeout(limit, sink.send(frame.encode())) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(SendError::Failed(e.to_string())),
                Err(_) => Err(SendError::Failed(format!("send stalled for {:?}", limit))),
            },
        }
    }

    /// Stops both directions and maps the failure to a close reason.
    fn fail(&self, error: RelayError) -> CloseReason {
        debug!(
            session_id = %self.session_id,
            code = error.code(),
            category = %error.category(),
            "Relay failed"
        );
        self.cancel.cancel();
        CloseReason::from(error)
    }

    fn record(&self, recorder: &mut Option<Box<dyn RecordingSink>>, chunk: &[u8]) {
        let Some(sink) = recorder.as_mut() else {
            return;
        };
        if let Err(e) = sink.record(chunk) {
            warn!(
                session_id = %self.session_id,
                error = %e,
                "Recording failed, continuing without it"
            );
            *recorder = None;
        }
    }

    /// Returns `None` when stopped by cancellation from elsewhere.
    async fn pump_inbound<St>(
        &self,
        frames: &mut St,
        bytes_in: &mut u64,
        frames_dropped: &mut u64,
    ) -> Option<CloseReason>
    where
        St: Stream<Item = Result<Bytes, ProtocolError>> + Unpin,
    {
        let idle = self.options.idle_read_timeout;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                next = tokio::time::timeout(idle, frames.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    warn!(session_id = %self.session_id, ?idle, "No inbound traffic, dropping stream");
                    return Some(self.fail(RelayError::Stream(format!(
                        "no inbound traffic for {:?}",
                        idle
                    ))));
                }
                Ok(None) => {
                    debug!(session_id = %self.session_id, "Client closed the stream");
                    self.cancel.cancel();
                    return Some(CloseReason::ClientDisconnected);
                }
                Ok(Some(Err(e))) => {
                    warn!(session_id = %self.session_id, error = %e, "Inbound stream failed");
                    return Some(self.fail(RelayError::Protocol(e)));
                }
                Ok(Some(Ok(message))) => message,
            };

            *bytes_in += message.len() as u64;
            self.events.touch(self.session_id);

            match InboundFrame::decode(message) {
                Ok(InboundFrame::Keepalive) => {
                    trace!(session_id = %self.session_id, "Keepalive");
                }
                Ok(InboundFrame::Input(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    let process = Arc::clone(self.process);
                    let task = tokio::task::spawn_blocking(move || process.write(&data));
                    // Teardown must not wait for a process that stopped reading.
                    let written = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return None,
                        written = task => written,
                    };
                    let failure = match written {
                        Ok(Ok(_)) => continue,
                        Ok(Err(e)) => e,
                        Err(e) => PtyError::Write(e.to_string()),
                    };
                    debug!(session_id = %self.session_id, error = %failure, "Process input rejected");
                    return Some(self.fail(RelayError::Process(failure)));
                }
                Ok(InboundFrame::Resize(size)) => {
                    let process = Arc::clone(self.process);
                    let task =
                        tokio::task::spawn_blocking(move || process.resize(size.cols, size.rows));
                    let resized = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return None,
                        resized = task => resized,
                    };
                    match resized {
                        Ok(Ok(())) => self.events.resized(self.session_id, size),
                        Ok(Err(e)) => {
                            warn!(session_id = %self.session_id, %size, error = %e, "Resize failed, keeping previous size");
                        }
                        Err(e) => {
                            warn!(session_id = %self.session_id, error = %e, "Resize task failed");
                        }
                    }
                }
                Err(e) => {
                    *frames_dropped += 1;
                    warn!(session_id = %self.session_id, error = %e, "Dropping inbound frame");
                }
            }
        }
    }
}
