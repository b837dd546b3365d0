use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::chunk::ChunkDims;

const DEFAULT_WS_BIND_ADDR: &str = "0.0.0.0:2222";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("usage: tibia-core <data-root> [ws_bind_addr] [options.yml]")]
    Usage,
    #[error("read {path} failed: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path} failed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid game options: {0}")]
    Invalid(String),
    #[error("TIBIA_HMAC_SECRET must be set to a non-empty value")]
    MissingSecret,
}

/// Server-wide constants announced to every client. Loaded once at startup
/// and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GameOptions {
    pub world_width: u16,
    pub world_height: u16,
    pub world_depth: u8,
    pub chunk_width: u8,
    pub chunk_height: u8,
    pub chunk_depth: u8,
    pub tick_ms: u8,
    pub clock_speed: u16,
    pub server_version: String,
    pub client_version: u16,
    /// Enables mount and addon fields in outfit records.
    pub features_enabled: bool,
    pub data_version: String,
}

impl Default for GameOptions {
    fn default() -> Self {
        Self {
            world_width: 2048,
            world_height: 2048,
            world_depth: 16,
            chunk_width: 9,
            chunk_height: 7,
            chunk_depth: 8,
            tick_ms: 50,
            clock_speed: 6,
            server_version: "10.98".to_string(),
            client_version: 1098,
            features_enabled: true,
            data_version: "1098".to_string(),
        }
    }
}

impl GameOptions {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&data).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let options: GameOptions =
            serde_yaml::from_str(data).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_width == 0 || self.chunk_height == 0 || self.chunk_depth == 0 {
            return Err(ConfigError::Invalid(
                "chunk dimensions must be non-zero".to_string(),
            ));
        }
        if u16::from(self.chunk_width) > self.world_width
            || u16::from(self.chunk_height) > self.world_height
        {
            return Err(ConfigError::Invalid(format!(
                "chunk {}x{} does not fit world {}x{}",
                self.chunk_width, self.chunk_height, self.world_width, self.world_height
            )));
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn chunk_dims(&self) -> ChunkDims {
        ChunkDims {
            width: self.chunk_width,
            height: self.chunk_height,
            depth: self.chunk_depth,
        }
    }

    pub fn tick_length(&self) -> Duration {
        Duration::from_millis(u64::from(self.tick_ms))
    }
}

#[derive(Debug)]
pub struct AppConfig {
    pub root: PathBuf,
    pub ws_bind_addr: String,
    pub ws_allowed_origins: Option<Vec<String>>,
    pub hmac_secret: String,
    pub log_level: log::LevelFilter,
    pub template_path: Option<PathBuf>,
    pub options: GameOptions,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        Self::from_sources(args, |key| std::env::var(key).ok())
    }

    fn from_sources(
        args: &[String],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if args.len() < 2 {
            return Err(ConfigError::Usage);
        }
        let env = |key: &str| {
            env(key).and_then(|value| {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
        };

        let root = Path::new(&args[1]).to_path_buf();
        let ws_bind_addr = match args.get(2) {
            Some(addr) => addr.clone(),
            None => env("TIBIA_WS_ADDR").unwrap_or_else(|| DEFAULT_WS_BIND_ADDR.to_string()),
        };
        let options = match args.get(3) {
            Some(path) => GameOptions::load(Path::new(path))?,
            None => {
                let default_path = root.join("options.yml");
                if default_path.exists() {
                    GameOptions::load(&default_path)?
                } else {
                    GameOptions::default()
                }
            }
        };
        let ws_allowed_origins = env("TIBIA_WS_ORIGINS").and_then(|value| {
            let entries: Vec<String> = value
                .split(',')
                .map(|entry| entry.trim())
                .filter(|entry| !entry.is_empty())
                .map(|entry| entry.to_string())
                .collect();
            if entries.is_empty() {
                None
            } else {
                Some(entries)
            }
        });
        let hmac_secret = env("TIBIA_HMAC_SECRET").ok_or(ConfigError::MissingSecret)?;
        let log_level = env("TIBIA_LOG_LEVEL")
            .and_then(|value| value.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info);
        let template_path = env("TIBIA_TEMPLATE").map(PathBuf::from);

        Ok(Self {
            root,
            ws_bind_addr,
            ws_allowed_origins,
            hmac_secret,
            log_level,
            template_path,
            options,
        })
    }
}
