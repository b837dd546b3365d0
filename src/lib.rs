pub mod config;
pub mod game;
pub mod net;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod world;

use std::sync::Arc;

pub use config::{AppConfig, GameOptions};
pub use game::GameServer;
pub use net::auth::{HandshakeAuthenticator, HandshakeError, LegacyTokenService};
pub use net::packet::{ClientPacketReader, CodecError, Frame, PacketReader, PacketWriter};
pub use net::server::{run_game_server, ServerConfig, ServerControl};
pub use session::{Identity, Session, SessionError, SessionRegistry, SessionState};
pub use world::provider::{TemplateWorld, WorldProvider};

use world::chunk_cache::{CachedWorld, DEFAULT_CHUNK_CACHE_CAPACITY};

pub fn run(args: &[String]) -> Result<(), String> {
    let config = AppConfig::from_args(args).map_err(|err| err.to_string())?;
    telemetry::logging::init(&config.root, config.log_level)?;
    log::info!(
        "starting server {} for client {} (data {})",
        config.options.server_version,
        config.options.client_version,
        config.options.data_version
    );

    let template = TemplateWorld::from_optional_file(config.template_path.as_deref())
        .map_err(|err| err.to_string())?;
    let cached = Arc::new(CachedWorld::new(template, DEFAULT_CHUNK_CACHE_CAPACITY));
    let world: Arc<dyn WorldProvider> = cached.clone();
    let control = Arc::new(ServerControl::new());
    let game = Arc::new(GameServer::new(
        Arc::new(config.options.clone()),
        world,
        Arc::clone(&control),
    ));
    let authenticator: Arc<dyn HandshakeAuthenticator> =
        Arc::new(LegacyTokenService::new(config.hmac_secret.clone()));

    let server_config = ServerConfig {
        bind_addr: config.ws_bind_addr.clone(),
        handshake: net::ws::WsHandshakeConfig {
            allowed_origins: config.ws_allowed_origins.clone(),
            ..net::ws::WsHandshakeConfig::default()
        },
        ..ServerConfig::default()
    };
    let listener = net::server::bind(&server_config)?;
    println!("tibia-core: listening on {}", server_config.bind_addr);

    let result = run_game_server(listener, server_config, game, authenticator);
    let stats = cached.stats();
    log::info!(
        "chunk cache: {} hits, {} misses, {} evictions ({:.1}% hit rate)",
        stats.hits,
        stats.misses,
        stats.evictions,
        stats.hit_rate() * 100.0
    );
    log::logger().flush();
    result
}
