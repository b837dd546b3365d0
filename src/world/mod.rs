pub mod chunk_cache;
pub mod position;
pub mod provider;
pub mod tick;
