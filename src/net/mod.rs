pub mod auth;
pub mod packet;
pub mod server;
pub mod transport;
pub mod ws;
