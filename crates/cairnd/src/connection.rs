//! Framed loopback connections.
//!
//! Each accepted or dialled TCP stream becomes a `Connection` handle plus
//! two tasks: a reader that parses length-prefixed `WrapperMessage` frames
//! and forwards them as [`Event`]s, and a writer that drains the outbound
//! queue. All protocol handling happens on the supervisor's single event
//! loop; these tasks only move bytes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use cairn_core::wire::{self, MessageType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Events delivered to the supervisor's event loop.
#[derive(Debug)]
pub enum Event {
    Accepted(Connection),
    Message {
        connection_id: u64,
        message_type: MessageType,
        payload: Vec<u8>,
    },
    ConnectionClosed(u64),
    /// A connection sat unclassified past the RPC timeout.
    NewConnectionExpired(u64),
    ChildExited {
        process_id: u64,
        exit_code: Option<i32>,
    },
    /// A cooperatively stopped child outlived its grace period.
    ChildStopTimeout {
        process_id: u64,
    },
    /// A crashed child's restart delay has elapsed.
    ChildRestartDue {
        process_id: u64,
    },
    Shutdown,
}

enum Outbound {
    Body(Vec<u8>),
    Close,
}

/// Handle to one live connection. Cloneable; writes are queued and flushed
/// in order by the writer task.
#[derive(Debug, Clone)]
pub struct Connection {
    id: u64,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader_abort: std::sync::Arc<tokio::task::AbortHandle>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue a wrapped message for sending. Errors are swallowed: a closed
    /// connection surfaces through `Event::ConnectionClosed` instead.
    pub fn send(&self, message_type: MessageType, body: Vec<u8>) {
        if self.outbound.send(Outbound::Body(body)).is_err() {
            tracing::debug!(
                connection = self.id,
                message = ?message_type,
                "send after close dropped"
            );
        }
    }

    /// Close the socket. Queued writes drain first; no further messages
    /// arrive from this connection.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.reader_abort.abort();
    }
}

/// Split a stream into reader/writer tasks and hand back the handle.
pub fn spawn(stream: TcpStream, events: mpsc::UnboundedSender<Event>) -> Connection {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let peer_addr = stream.peer_addr().ok();
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    // Writer: frame and flush queued bodies until told to close.
    tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let body = match outbound {
                Outbound::Body(body) => body,
                Outbound::Close => break,
            };
            let frame = match wire::encode_frame(body) {
                Ok(frame) => frame,
                Err(error) => {
                    tracing::error!(connection = id, %error, "unframeable message dropped");
                    continue;
                }
            };
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Reader: parse frames, forward messages, report the close.
    let reader_events = events;
    let reader = tokio::spawn(async move {
        loop {
            let mut header = [0u8; wire::FRAME_HEADER_SIZE];
            if read_half.read_exact(&mut header).await.is_err() {
                break;
            }
            let length = u32::from_be_bytes(header) as usize;
            if length > wire::MAX_FRAME_SIZE {
                tracing::error!(connection = id, length, "oversized frame, closing");
                break;
            }
            let mut body = vec![0u8; length];
            if read_half.read_exact(&mut body).await.is_err() {
                break;
            }
            match wire::unwrap(&body) {
                Ok((message_type, payload)) => {
                    if reader_events
                        .send(Event::Message {
                            connection_id: id,
                            message_type,
                            payload,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(connection = id, %error, "unparseable frame dropped");
                }
            }
        }
        let _ = reader_events.send(Event::ConnectionClosed(id));
    });

    Connection {
        id,
        peer_addr,
        outbound: outbound_tx,
        reader_abort: std::sync::Arc::new(reader.abort_handle()),
    }
}

/// Read one framed message from a stream. Client-side helper for the
/// simple lock-step exchanges in the controller and the vault.
pub async fn read_message(
    stream: &mut TcpStream,
) -> anyhow::Result<(MessageType, Vec<u8>)> {
    let mut header = [0u8; wire::FRAME_HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let length = u32::from_be_bytes(header) as usize;
    anyhow::ensure!(length <= wire::MAX_FRAME_SIZE, "oversized frame");
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok(wire::unwrap(&body)?)
}

/// Write one framed message to a stream.
pub async fn write_message(stream: &mut TcpStream, body: Vec<u8>) -> anyhow::Result<()> {
    let frame = wire::encode_frame(body)?;
    stream.write_all(&frame).await?;
    Ok(())
}
