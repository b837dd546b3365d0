use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use thiserror::Error;

use crate::net::ws::{self, WsFrameError};
use crate::protocol::Frame;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Binary,
    Text,
}

/// One piece of a logical message. `end_of_message` marks the last piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub end_of_message: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Fragment(Fragment),
    Close,
    /// Nothing arrived within the poll interval.
    Timeout,
}

/// Message-oriented connection a session runs over. Receives return within
/// the transport's poll interval so the caller can check for cancellation.
pub trait MessageTransport: Send {
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn receive(&mut self) -> Result<Incoming, TransportError>;
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct WsTransportConfig {
    pub max_message_bytes: usize,
    pub poll_interval: Duration,
    pub write_timeout: Duration,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_timeout: Duration::from_secs(5),
        }
    }
}

pub struct WsMessageTransport {
    stream: TcpStream,
    reader: ws::FrameReader,
    max_message_bytes: usize,
    /// Kind of the fragmented message in flight, if any.
    continuing: Option<MessageKind>,
    message_bytes: usize,
    open: bool,
}

impl WsMessageTransport {
    /// Wraps a stream whose upgrade handshake already completed.
    pub fn new(stream: TcpStream, config: WsTransportConfig) -> Result<Self, TransportError> {
        stream.set_read_timeout(Some(config.poll_interval))?;
        stream.set_write_timeout(Some(config.write_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            reader: ws::FrameReader::new(config.max_message_bytes),
            max_message_bytes: config.max_message_bytes,
            continuing: None,
            message_bytes: 0,
            open: true,
        })
    }

    fn data_fragment(&mut self, frame: ws::WsFrame) -> Result<Fragment, TransportError> {
        let kind = match (frame.opcode, self.continuing) {
            (ws::OP_CONTINUATION, Some(kind)) => kind,
            (ws::OP_CONTINUATION, None) => {
                return Err(TransportError::Protocol(
                    "continuation without a message".to_string(),
                ))
            }
            (_, Some(_)) => {
                return Err(TransportError::Protocol(
                    "new message before the previous one ended".to_string(),
                ))
            }
            (ws::OP_TEXT, None) => {
                self.message_bytes = 0;
                MessageKind::Text
            }
            (_, None) => {
                self.message_bytes = 0;
                MessageKind::Binary
            }
        };
        self.message_bytes = self.message_bytes.saturating_add(frame.payload.len());
        if self.message_bytes > self.max_message_bytes {
            return Err(TransportError::Protocol(format!(
                "message of {} bytes exceeds max {}",
                self.message_bytes, self.max_message_bytes
            )));
        }
        self.continuing = if frame.fin { None } else { Some(kind) };
        Ok(Fragment {
            kind,
            payload: frame.payload,
            end_of_message: frame.fin,
        })
    }

    fn fail(&mut self, err: TransportError) -> TransportError {
        if matches!(err, TransportError::Protocol(_)) {
            let _ = ws::write_close(&mut self.stream, ws::CLOSE_PROTOCOL_ERROR);
        }
        self.shutdown();
        err
    }

    fn shutdown(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

impl MessageTransport for WsMessageTransport {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn receive(&mut self) -> Result<Incoming, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        loop {
            let frame = match self.reader.read(&mut self.stream) {
                Ok(frame) => frame,
                Err(WsFrameError::Timeout) => return Ok(Incoming::Timeout),
                Err(WsFrameError::Closed) => {
                    self.shutdown();
                    return Ok(Incoming::Close);
                }
                Err(WsFrameError::Io(err)) => return Err(self.fail(TransportError::Io(err))),
                Err(WsFrameError::Protocol(reason)) => {
                    return Err(self.fail(TransportError::Protocol(reason)))
                }
            };
            match frame.opcode {
                ws::OP_CONTINUATION | ws::OP_TEXT | ws::OP_BINARY => {
                    return match self.data_fragment(frame) {
                        Ok(fragment) => Ok(Incoming::Fragment(fragment)),
                        Err(err) => Err(self.fail(err)),
                    };
                }
                ws::OP_CLOSE => {
                    let _ = ws::write_close(&mut self.stream, ws::CLOSE_NORMAL);
                    self.shutdown();
                    return Ok(Incoming::Close);
                }
                ws::OP_PING => {
                    if let Err(err) = ws::write_frame(&mut self.stream, ws::OP_PONG, &frame.payload)
                    {
                        return Err(self.fail(TransportError::Io(err)));
                    }
                }
                ws::OP_PONG => {}
                other => {
                    return Err(self.fail(TransportError::Protocol(format!(
                        "reserved opcode 0x{other:x}"
                    ))))
                }
            }
        }
    }

    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        ws::write_frame(&mut self.stream, ws::OP_BINARY, frame.as_bytes())
            .map_err(|err| self.fail(TransportError::Io(err)))
    }

    fn close(&mut self) {
        if self.open {
            let _ = ws::write_close(&mut self.stream, ws::CLOSE_NORMAL);
            self.shutdown();
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
