use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::game::GameServer;
use crate::net::auth::{HandshakeAuthenticator, HandshakeError};
use crate::net::transport::{WsMessageTransport, WsTransportConfig};
use crate::net::ws;
use crate::session::SessionError;
use crate::world::tick::{TickError, TickScheduler, TickSleep};

const ACCEPT_IDLE: Duration = Duration::from_millis(50);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide run flag. Every long wait in the server goes through
/// `wait_timeout` so a shutdown request wakes it at once.
#[derive(Debug)]
pub struct ServerControl {
    running: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerControl {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Blocks for up to `duration` or until shutdown. Returns whether the
    /// server is still running.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = match self.wake.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        self.is_running()
    }
}

impl TickSleep for ServerControl {
    fn sleep(&self, duration: Duration) -> bool {
        self.wait_timeout(duration)
    }

    fn is_running(&self) -> bool {
        ServerControl::is_running(self)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub handshake: ws::WsHandshakeConfig,
    pub transport: WsTransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:2222".to_string(),
            handshake: ws::WsHandshakeConfig::default(),
            transport: WsTransportConfig::default(),
        }
    }
}

pub fn bind(config: &ServerConfig) -> Result<TcpListener, String> {
    let listener = TcpListener::bind(&config.bind_addr)
        .map_err(|err| format!("bind {} failed: {}", config.bind_addr, err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("game listener nonblocking failed: {}", err))?;
    Ok(listener)
}

/// Accepts game connections until shutdown, one thread per connection, and
/// drives the world tick alongside. A fatal tick error stops the server and
/// is returned.
pub fn run_game_server(
    listener: TcpListener,
    config: ServerConfig,
    game: Arc<GameServer>,
    authenticator: Arc<dyn HandshakeAuthenticator>,
) -> Result<(), String> {
    let control = Arc::clone(game.control());
    let local_addr = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| config.bind_addr.clone());
    log::info!("game server listening on {}", local_addr);

    let tick_game = Arc::clone(&game);
    let tick_handle = TickScheduler::new(game.options().tick_length())
        .spawn(Arc::clone(&control), move |tick| tick_game.tick(tick))
        .map_err(|err| format!("tick thread spawn failed: {}", err))?;

    let mut last_status = Instant::now();
    while control.is_running() && !tick_handle.is_finished() {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::debug!("game connection from {}", addr);
                let config = config.clone();
                let game = Arc::clone(&game);
                let authenticator = Arc::clone(&authenticator);
                let spawned = thread::Builder::new()
                    .name(format!("conn-{addr}"))
                    .spawn(move || {
                        if let Err(err) =
                            handle_game_connection(stream, addr, &config, game, authenticator.as_ref())
                        {
                            log::warn!("game connection {} error: {}", addr, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("connection thread spawn failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                control.wait_timeout(ACCEPT_IDLE);
            }
            Err(err) => {
                log::error!("game accept error: {}", err);
            }
        }
        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            log::info!("{} players online", game.registry().len());
        }
    }

    // Sessions see the flag within one poll interval and clean up on their own.
    control.request_shutdown();
    match tick_handle.join() {
        Ok(Ok(report)) => {
            log::info!("game server stopped after {} ticks", report.ticks);
            Ok(())
        }
        Ok(Err(TickError::Fatal(reason))) | Ok(Err(TickError::Transient(reason))) => {
            Err(format!("world tick failed: {}", reason))
        }
        Err(_) => Err("tick thread panicked".to_string()),
    }
}

fn handle_game_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    config: &ServerConfig,
    game: Arc<GameServer>,
    authenticator: &dyn HandshakeAuthenticator,
) -> Result<(), String> {
    stream
        .set_nonblocking(false)
        .map_err(|err| format!("stream blocking set failed: {err}"))?;
    stream
        .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(|err| format!("handshake timeout set failed: {err}"))?;

    let identity = match ws::accept_handshake(&mut stream, &config.handshake, authenticator) {
        Ok(identity) => identity,
        Err(HandshakeError::Rejected(reason)) => {
            log::info!("handshake from {} rejected: {}", addr, reason);
            return Ok(());
        }
        Err(err) => return Err(err.to_string()),
    };
    let transport = WsMessageTransport::new(stream, config.transport)
        .map_err(|err| format!("transport setup failed: {err}"))?;

    let session = match game.create_session(identity, Box::new(transport)) {
        Ok(session) => session,
        Err(SessionError::DuplicateSession(_)) => return Ok(()),
        Err(err) => return Err(err.to_string()),
    };
    match session.run() {
        Ok(()) => Ok(()),
        Err(err) if err.is_disconnect() => Ok(()),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    use crate::config::GameOptions;
    use crate::net::auth::LegacyTokenService;
    use crate::net::packet::ClientPacketWriter;
    use crate::net::ws::tests::{masked_frame, read_frame};
    use crate::protocol::opcodes::{ClientOpcode, ServerOpcode};
    use crate::session::Identity;
    use crate::world::provider::TemplateWorld;

    const SECRET: &str = "integration-secret";

    struct RunningServer {
        addr: SocketAddr,
        game: Arc<GameServer>,
        handle: thread::JoinHandle<Result<(), String>>,
    }

    fn start_server() -> RunningServer {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            transport: WsTransportConfig {
                poll_interval: Duration::from_millis(20),
                ..WsTransportConfig::default()
            },
            ..ServerConfig::default()
        };
        let listener = bind(&config).expect("bind");
        let addr = listener.local_addr().expect("addr");
        let game = Arc::new(GameServer::new(
            Arc::new(GameOptions::default()),
            Arc::new(TemplateWorld::default()),
            Arc::new(ServerControl::new()),
        ));
        let authenticator: Arc<dyn HandshakeAuthenticator> =
            Arc::new(LegacyTokenService::new(SECRET));
        let server_game = Arc::clone(&game);
        let handle =
            thread::spawn(move || run_game_server(listener, config, server_game, authenticator));
        RunningServer { addr, game, handle }
    }

    fn open_socket(addr: SocketAddr, token: &str) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .expect("timeout");
        let request = format!(
            "GET /ws?token={token} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
Connection: Upgrade\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).expect("request");
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(0) | Err(_) => break,
                Ok(_) => response.push(byte[0]),
            }
        }
        let status = String::from_utf8_lossy(&response)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        (stream, status)
    }

    fn login_packet() -> Vec<u8> {
        let mut writer = ClientPacketWriter::new();
        writer.write_u8(ClientOpcode::RequestLogin.as_u8());
        writer.write_string_u8("account").expect("account");
        writer.write_string_u8("password").expect("password");
        writer.into_vec()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn websocket_login_end_to_end() {
        let server = start_server();
        let tokens = LegacyTokenService::new(SECRET);
        let token = tokens.issue("Sir Tibius").expect("token");

        let (mut client, status) = open_socket(server.addr, &token);
        assert_eq!(status, "HTTP/1.1 101 Switching Protocols");

        let server_data = read_frame(&mut client, 1 << 20).expect("server data");
        assert_eq!(server_data.opcode, ws::OP_BINARY);
        assert_eq!(server_data.payload[0], ServerOpcode::SendServerData.as_u8());

        client
            .write_all(&masked_frame(true, ws::OP_BINARY, &login_packet()))
            .expect("login");
        let mut opcodes = Vec::new();
        for _ in 0..5 {
            let frame = read_frame(&mut client, 1 << 20).expect("frame");
            opcodes.push(frame.payload[0]);
        }
        assert_eq!(
            opcodes,
            vec![
                ServerOpcode::LoginSuccess.as_u8(),
                ServerOpcode::WorldTime.as_u8(),
                ServerOpcode::WriteSpells.as_u8(),
                ServerOpcode::PlayerStatistics.as_u8(),
                ServerOpcode::WriteChunk.as_u8(),
            ]
        );
        assert!(server.game.registry().is_online(&Identity::new("sir tibius")));

        // A second socket for the same character is refused without data.
        let duplicate = tokens.issue("SIR TIBIUS").expect("token");
        let (mut second, status) = open_socket(server.addr, &duplicate);
        assert_eq!(status, "HTTP/1.1 101 Switching Protocols");
        let frame = read_frame(&mut second, 1024).expect("close");
        assert_eq!(frame.opcode, ws::OP_CLOSE);

        ws::write_close(&mut client, ws::CLOSE_NORMAL).expect("close");
        assert!(wait_until(|| server.game.registry().is_empty()));

        server.game.control().request_shutdown();
        server.handle.join().expect("join").expect("clean shutdown");
    }

    #[test]
    fn bad_token_is_refused_before_upgrade() {
        let server = start_server();
        let forged = LegacyTokenService::new("wrong-secret")
            .issue("Alice")
            .expect("token");
        let (_client, status) = open_socket(server.addr, &forged);
        assert_eq!(status, "HTTP/1.1 401 Unauthorized");
        assert!(server.game.registry().is_empty());

        server.game.control().request_shutdown();
        server.handle.join().expect("join").expect("clean shutdown");
    }

    #[test]
    fn wait_timeout_wakes_on_shutdown() {
        let control = Arc::new(ServerControl::new());
        assert!(control.wait_timeout(Duration::from_millis(5)));

        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || {
                let started = Instant::now();
                let running = control.wait_timeout(Duration::from_secs(10));
                (running, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        control.request_shutdown();
        let (running, waited) = waiter.join().expect("waiter");
        assert!(!running);
        assert!(waited < Duration::from_secs(5));
    }
}
