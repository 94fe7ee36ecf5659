//! Interactive attach: puts the local terminal in raw mode and relays it to
//! a session over the framed TCP protocol.

use std::io;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossterm::event;
use crossterm::event::Event;
use crossterm::event::KeyCode;
use crossterm::event::KeyEvent;
use crossterm::event::KeyEventKind;
use crossterm::event::KeyModifiers;
use crossterm::terminal;
use futures_util::SinkExt;
use futures_util::StreamExt;
use termrelay_protocol::preamble;
use termrelay_protocol::InboundFrame;
use termrelay_protocol::MessageCodec;
use termrelay_protocol::OutboundFrame;
use termrelay_protocol::WindowSize;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::error::AttachError;

/// Ctrl+\ (ASCII FS).
const DETACH_BYTE: u8 = 0x1c;
const EVENT_POLL: Duration = Duration::from_millis(50);
const INPUT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalInput {
    Bytes(Vec<u8>),
    Resize(u16, u16),
    Detach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The user detached; the session stays open on the relay side.
    Detached,
    /// The relay closed the stream.
    Closed,
}

/// Ignores a signal while alive, restoring the default disposition on drop.
#[must_use = "dropping the guard restores the default handler"]
struct SignalGuard {
    signal: libc::c_int,
}

impl SignalGuard {
    fn new(signal: libc::c_int) -> Self {
        // SAFETY: SIG_IGN is a valid disposition for any catchable signal.
        unsafe {
            libc::signal(signal, libc::SIG_IGN);
        }
        Self { signal }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        // SAFETY: SIG_DFL is always a valid disposition.
        unsafe {
            libc::signal(self.signal, libc::SIG_DFL);
        }
    }
}

/// Raw mode for the lifetime of the guard.
#[must_use = "TerminalGuard must be held for the duration of the attach session"]
struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Result<Self, AttachError> {
        terminal::enable_raw_mode().map_err(AttachError::Terminal)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = stdout.write_all(b"\x1b[0m\x1b[?25h");
        let _ = stdout.flush();
    }
}

/// Connects to the relay at `addr` and drives `session_id` from this
/// terminal until the user detaches or the relay closes the stream.
pub async fn attach(
    addr: SocketAddr,
    session_id: &str,
    keepalive: Duration,
) -> Result<AttachOutcome, AttachError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| AttachError::Connect {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);

    let mut framed = Framed::new(stream, MessageCodec::default());
    framed
        .send(preamble::encode(session_id))
        .await
        .map_err(|e| AttachError::Stream(e.to_string()))?;

    let _sigquit = SignalGuard::new(libc::SIGQUIT);
    let guard = TerminalGuard::new()?;

    let (cols, rows) = terminal::size().map_err(AttachError::Terminal)?;
    let (tx, rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
    // The relay starts the shell at the admitted size; match the real one.
    let _ = tx.send(TerminalInput::Resize(cols, rows)).await;

    let stop = Arc::new(AtomicBool::new(false));
    let reader = spawn_input_reader(tx, Arc::clone(&stop)).map_err(AttachError::Terminal)?;

    let mut stdout = io::stdout();
    let result = relay_session(framed, rx, &mut stdout, keepalive).await;

    stop.store(true, Ordering::SeqCst);
    if reader.join().is_err() {
        debug!("Input reader panicked");
    }
    drop(guard);
    result
}

/// Reads terminal events on a plain thread; crossterm's reader blocks.
fn spawn_input_reader(
    tx: mpsc::Sender<TerminalInput>,
    stop: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("attach-input".to_string())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match event::poll(EVENT_POLL) {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(_) => break,
                }
                let input = match event::read() {
                    Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                        match key_event_to_bytes(&key) {
                            Some(bytes) if bytes == [DETACH_BYTE] => TerminalInput::Detach,
                            Some(bytes) => TerminalInput::Bytes(bytes),
                            None => continue,
                        }
                    }
                    Ok(Event::Paste(text)) => TerminalInput::Bytes(text.into_bytes()),
                    Ok(Event::Resize(cols, rows)) => TerminalInput::Resize(cols, rows),
                    Ok(_) => continue,
                    Err(_) => TerminalInput::Detach,
                };
                let last = input == TerminalInput::Detach;
                if tx.blocking_send(input).is_err() || last {
                    break;
                }
            }
        })
}

/// Pumps terminal input to the relay and relay output to `out`.
///
/// Sends a keepalive every `keepalive` so the relay's idle check never
/// fires on a quiet user.
pub async fn relay_session<S, W>(
    mut framed: Framed<S, MessageCodec>,
    mut inputs: mpsc::Receiver<TerminalInput>,
    out: &mut W,
    keepalive: Duration,
) -> Result<AttachOutcome, AttachError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: Write,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            input = inputs.recv() => match input {
                Some(TerminalInput::Bytes(bytes)) => InboundFrame::Input(Bytes::from(bytes)),
                Some(TerminalInput::Resize(cols, rows)) if cols > 0 && rows > 0 => {
                    InboundFrame::Resize(WindowSize::new(cols, rows))
                }
                Some(TerminalInput::Resize(..)) => continue,
                Some(TerminalInput::Detach) | None => {
                    let _ = framed.close().await;
                    return Ok(AttachOutcome::Detached);
                }
            },
            message = framed.next() => match message {
                None => return Ok(AttachOutcome::Closed),
                Some(Err(e)) => return Err(AttachError::Stream(e.to_string())),
                Some(Ok(message)) => {
                    if let OutboundFrame::Output(data) = OutboundFrame::decode(message) {
                        out.write_all(&data).map_err(AttachError::Terminal)?;
                        out.flush().map_err(AttachError::Terminal)?;
                    }
                    continue;
                }
            },
            _ = ticker.tick() => InboundFrame::Keepalive,
        };

        framed
            .send(frame.encode())
            .await
            .map_err(|e| AttachError::Stream(e.to_string()))?;
    }
}

fn key_event_to_bytes(key: &KeyEvent) -> Option<Vec<u8>> {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let alt = key.modifiers.contains(KeyModifiers::ALT);

    let bytes = match key.code {
        KeyCode::Char(c) if ctrl => vec![control_byte(c)?],
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            let encoded = c.encode_utf8(&mut buf).as_bytes();
            if alt {
                [&[0x1b][..], encoded].concat()
            } else {
                encoded.to_vec()
            }
        }
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::F(n) => function_key(n)?.to_vec(),
        _ => return None,
    };
    Some(bytes)
}

fn control_byte(c: char) -> Option<u8> {
    match c {
        'a'..='z' => Some(c as u8 - b'a' + 1),
        'A'..='Z' => Some(c as u8 - b'A' + 1),
        '@' | ' ' | '2' => Some(0x00),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(DETACH_BYTE),
        ']' | '5' => Some(0x1d),
        '^' | '6' => Some(0x1e),
        '_' | '7' => Some(0x1f),
        '?' | '8' => Some(0x7f),
        _ => None,
    }
}

fn function_key(n: u8) -> Option<&'static [u8]> {
    let seq: &'static [u8] = match n {
        1 => b"\x1bOP",
        2 => b"\x1bOQ",
        3 => b"\x1bOR",
        4 => b"\x1bOS",
        5 => b"\x1b[15~",
        6 => b"\x1b[17~",
        7 => b"\x1b[18~",
        8 => b"\x1b[19~",
        9 => b"\x1b[20~",
        10 => b"\x1b[21~",
        11 => b"\x1b[23~",
        12 => b"\x1b[24~",
        _ => return None,
    };
    Some(seq)
}
