use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::GameOptions;
use crate::game::GameServer;
use crate::net::packet::{CodecError, Frame};
use crate::net::transport::{Incoming, MessageKind, MessageTransport, TransportError};
use crate::protocol::builders;
use crate::session::handlers::SessionContext;
use crate::session::{Identity, SessionHandle};
use crate::world::provider::{WorldError, WorldProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, nothing sent yet.
    Connected,
    /// Server data sent, waiting for the client's login request.
    AwaitingLogin,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connected => "connected",
            SessionState::AwaitingLogin => "awaiting login",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("packet decode failed: {0}")]
    Codec(#[from] CodecError),
    #[error("{0} already has an active session")]
    DuplicateSession(String),
    #[error("connection closed")]
    TransportClosed,
    #[error("session cancelled")]
    Cancelled,
    #[error("{0}")]
    Transport(TransportError),
    #[error("already logged in")]
    AlreadyLoggedIn,
    #[error("login request while {0}")]
    NotAwaitingLogin(SessionState),
    #[error("world lookup failed: {0}")]
    World(#[from] WorldError),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => SessionError::TransportClosed,
            other => SessionError::Transport(other),
        }
    }
}

impl SessionError {
    /// Errors after which the connection is unusable.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            SessionError::TransportClosed | SessionError::Cancelled | SessionError::Transport(_)
        )
    }

    /// Normal ways for a session to end, logged as such.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SessionError::TransportClosed | SessionError::Cancelled)
    }
}

/// One connected character. Owns its transport; dropping the session
/// deregisters it and closes the connection, whichever way it ended.
pub struct Session {
    handle: SessionHandle,
    state: SessionState,
    transport: Box<dyn MessageTransport>,
    server: Arc<GameServer>,
}

impl Session {
    pub fn open(
        identity: Identity,
        mut transport: Box<dyn MessageTransport>,
        server: Arc<GameServer>,
    ) -> Result<Self, SessionError> {
        let handle = SessionHandle::new(identity, transport.peer_addr());
        if !server.registry().try_add(handle.clone()) {
            transport.close();
            log::info!(
                "rejected second connection for {} from {}",
                handle.identity(),
                peer_label(&handle)
            );
            return Err(SessionError::DuplicateSession(
                handle.identity().as_str().to_string(),
            ));
        }
        Ok(Self {
            handle,
            state: SessionState::Connected,
            transport,
            server,
        })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the connection to completion. Client disconnects, kicks and
    /// shutdown come back as `TransportClosed` or `Cancelled`.
    pub fn run(mut self) -> Result<(), SessionError> {
        log::info!(
            "{} connected from {} ({} online)",
            self.handle.identity(),
            peer_label(&self.handle),
            self.server.registry().len()
        );
        let result = self.serve();
        self.state = SessionState::Closed;
        let online_for = self.handle.connected_at().elapsed().as_secs();
        match &result {
            Ok(()) => log::info!("{} disconnected after {}s", self.handle.identity(), online_for),
            Err(err) if err.is_disconnect() => {
                log::info!("{} disconnected after {}s: {}", self.handle.identity(), online_for, err)
            }
            Err(err) => log::warn!("{} dropped after {}s: {}", self.handle.identity(), online_for, err),
        }
        result
    }

    fn serve(&mut self) -> Result<(), SessionError> {
        self.send_server_data()?;

        let mut message = Vec::new();
        loop {
            if self.handle.is_cancelled() || !self.server.control().is_running() {
                return Err(SessionError::Cancelled);
            }
            let fragment = match self.transport.receive()? {
                Incoming::Timeout => continue,
                Incoming::Close => return Ok(()),
                Incoming::Fragment(fragment) => fragment,
            };
            if fragment.kind == MessageKind::Text {
                // Only binary messages carry packets; a text message also
                // breaks up any binary message that was in progress.
                if !message.is_empty() {
                    log::debug!(
                        "{}: text message dropped {} buffered bytes",
                        self.handle.identity(),
                        message.len()
                    );
                    message.clear();
                }
                continue;
            }
            message.extend_from_slice(&fragment.payload);
            if !fragment.end_of_message {
                continue;
            }
            let packet = std::mem::take(&mut message);
            self.process_packet(&packet)?;
        }
    }

    fn send_server_data(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Ok(());
        }
        let frame = builders::server_data(self.server.options())?;
        self.send(&frame)?;
        self.state = SessionState::AwaitingLogin;
        Ok(())
    }

    /// Runs one inbound packet. Failures confined to the packet are logged
    /// and swallowed; only connection-level failures end the session.
    fn process_packet(&mut self, packet: &[u8]) -> Result<(), SessionError> {
        let Some((&opcode, payload)) = packet.split_first() else {
            return Ok(());
        };
        let handlers = Arc::clone(self.server.handlers());
        match handlers.dispatch(opcode, payload, self) {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::debug!(
                    "{}: no handler for opcode 0x{:02x} ({} bytes)",
                    self.handle.identity(),
                    opcode,
                    payload.len()
                );
                Ok(())
            }
            Err(err) if err.ends_session() => Err(err),
            Err(err) => {
                log::warn!(
                    "{}: packet 0x{:02x} failed: {}",
                    self.handle.identity(),
                    opcode,
                    err
                );
                Ok(())
            }
        }
    }
}

impl SessionContext for Session {
    fn identity(&self) -> &Identity {
        self.handle.identity()
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    fn options(&self) -> &GameOptions {
        self.server.options()
    }

    fn world(&self) -> &dyn WorldProvider {
        self.server.world()
    }

    fn send(&mut self, frame: &Frame) -> Result<(), SessionError> {
        self.transport.send(frame).map_err(SessionError::from)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.state = SessionState::Closed;
        self.server.registry().remove_if_same(&self.handle);
        if self.transport.is_open() {
            self.transport.close();
        }
    }
}

fn peer_label(handle: &SessionHandle) -> String {
    handle
        .peer()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown peer".to_string())
}
