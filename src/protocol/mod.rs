//! Server to client message layouts and the DTOs they are built from.

pub mod builders;
pub mod chunk;
pub mod dto;
pub mod opcodes;

pub use crate::net::packet::Frame;
