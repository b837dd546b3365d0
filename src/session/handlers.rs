use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::GameOptions;
use crate::net::packet::{ClientPacketReader, Frame};
use crate::protocol::builders;
use crate::protocol::chunk::ChunkCoord;
use crate::protocol::dto::ChunkData;
use crate::protocol::opcodes::ClientOpcode;
use crate::session::{Identity, SessionError, SessionState};
use crate::world::provider::{WorldError, WorldProvider};

/// What a packet handler may see and do on the session it runs for.
pub trait SessionContext {
    fn identity(&self) -> &Identity;
    fn state(&self) -> SessionState;
    fn set_state(&mut self, state: SessionState);
    fn options(&self) -> &GameOptions;
    fn world(&self) -> &dyn WorldProvider;
    fn send(&mut self, frame: &Frame) -> Result<(), SessionError>;
}

pub trait PacketHandler: Send + Sync {
    fn handle(
        &self,
        ctx: &mut dyn SessionContext,
        reader: &mut ClientPacketReader<'_>,
    ) -> Result<(), SessionError>;
}

/// Client opcode to handler lookup.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<u8, Box<dyn PacketHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(ClientOpcode::RequestLogin.as_u8(), RequestLoginHandler);
        table
    }

    /// Installs `handler` for `opcode`, replacing any earlier one.
    pub fn register(&mut self, opcode: u8, handler: impl PacketHandler + 'static) {
        self.handlers.insert(opcode, Box::new(handler));
    }

    /// Runs the handler for `opcode` over `payload`. Returns `Ok(false)` when
    /// no handler is registered.
    pub fn dispatch(
        &self,
        opcode: u8,
        payload: &[u8],
        ctx: &mut dyn SessionContext,
    ) -> Result<bool, SessionError> {
        let Some(handler) = self.handlers.get(&opcode) else {
            return Ok(false);
        };
        let mut reader = ClientPacketReader::new(payload);
        handler.handle(ctx, &mut reader)?;
        Ok(true)
    }
}

/// Enters the game. The connection was already authenticated during the
/// handshake, so the account and password fields are read and ignored.
pub struct RequestLoginHandler;

impl PacketHandler for RequestLoginHandler {
    fn handle(
        &self,
        ctx: &mut dyn SessionContext,
        reader: &mut ClientPacketReader<'_>,
    ) -> Result<(), SessionError> {
        let _account = reader.read_string_u8()?;
        let _password = reader.read_string_u8()?;

        match ctx.state() {
            SessionState::AwaitingLogin => {}
            SessionState::Active => return Err(SessionError::AlreadyLoggedIn),
            other => return Err(SessionError::NotAwaitingLogin(other)),
        }

        let frames = login_sequence(ctx)?;
        ctx.set_state(SessionState::Active);
        for frame in &frames {
            ctx.send(frame)?;
        }
        log::info!("{} entered the game", ctx.identity());
        Ok(())
    }
}

/// Builds the full login sequence up front so a world or codec failure
/// leaves the session waiting for another attempt.
fn login_sequence(ctx: &dyn SessionContext) -> Result<Vec<Frame>, SessionError> {
    let options = ctx.options();
    let identity = ctx.identity();
    let world = ctx.world();

    let player = world.player_snapshot(identity)?;
    let coord = ChunkCoord::for_position(
        player.position,
        options.chunk_dims(),
        options.world_width,
        options.world_height,
    );
    let tiles = world.chunk_tiles(&coord, options.chunk_dims())?;
    let expected = options.chunk_dims().tile_count();
    if tiles.len() != expected {
        return Err(WorldError::ChunkSize {
            expected,
            actual: tiles.len(),
        }
        .into());
    }
    let chunk = ChunkData { coord, tiles };
    let spells = world.spells(identity);

    Ok(vec![
        builders::login_success(&player, options.features_enabled)?,
        builders::world_time(unix_seconds()),
        builders::write_spells(&spells)?,
        builders::player_statistics(player.capacity, player.attack, player.armor, player.speed),
        builders::write_chunk(&chunk),
    ])
}

/// Seconds since the epoch, pinned at `u32::MAX` once they no longer fit.
fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
