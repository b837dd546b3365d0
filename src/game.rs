use std::sync::Arc;

use crate::config::GameOptions;
use crate::net::server::ServerControl;
use crate::net::transport::MessageTransport;
use crate::session::handlers::HandlerTable;
use crate::session::{Identity, Session, SessionError, SessionRegistry};
use crate::world::provider::WorldProvider;
use crate::world::tick::TickError;

/// Process-wide game state every session shares.
pub struct GameServer {
    options: Arc<GameOptions>,
    registry: Arc<SessionRegistry>,
    world: Arc<dyn WorldProvider>,
    handlers: Arc<HandlerTable>,
    control: Arc<ServerControl>,
}

impl GameServer {
    pub fn new(
        options: Arc<GameOptions>,
        world: Arc<dyn WorldProvider>,
        control: Arc<ServerControl>,
    ) -> Self {
        Self::with_handlers(options, world, control, HandlerTable::with_defaults())
    }

    pub fn with_handlers(
        options: Arc<GameOptions>,
        world: Arc<dyn WorldProvider>,
        control: Arc<ServerControl>,
        handlers: HandlerTable,
    ) -> Self {
        Self {
            options,
            registry: Arc::new(SessionRegistry::new()),
            world,
            handlers: Arc::new(handlers),
            control,
        }
    }

    pub fn options(&self) -> &GameOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn world(&self) -> &dyn WorldProvider {
        self.world.as_ref()
    }

    pub fn handlers(&self) -> &Arc<HandlerTable> {
        &self.handlers
    }

    pub fn control(&self) -> &Arc<ServerControl> {
        &self.control
    }

    /// Binds an authenticated connection to its character. Fails without
    /// sending anything when the character is already online.
    pub fn create_session(
        self: &Arc<Self>,
        identity: Identity,
        transport: Box<dyn MessageTransport>,
    ) -> Result<Session, SessionError> {
        Session::open(identity, transport, Arc::clone(self))
    }

    /// Advances the world by one tick. Nothing moves on its own yet.
    pub fn tick(&self, _tick: u64) -> Result<(), TickError> {
        Ok(())
    }
}
