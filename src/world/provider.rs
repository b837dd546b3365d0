use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::chunk::{ChunkCoord, ChunkDims};
use crate::protocol::dto::{
    Item, Outfit, OutfitDetails, OutfitEntry, PlayerSnapshot, Tile, EQUIPMENT_SLOTS,
};
use crate::session::Identity;
use crate::world::position::{Direction, Position};

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("unknown character '{0}'")]
    UnknownCharacter(String),
    #[error("read template {path} failed: {source}")]
    TemplateRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse template {path} failed: {source}")]
    TemplateParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
    #[error("world data unavailable: {0}")]
    Unavailable(String),
    #[error("chunk has {actual} tiles, expected {expected}")]
    ChunkSize { expected: usize, actual: usize },
}

/// Content source the login sequence reads from.
pub trait WorldProvider: Send + Sync {
    fn player_snapshot(&self, identity: &Identity) -> Result<PlayerSnapshot, WorldError>;
    fn chunk_tiles(&self, coord: &ChunkCoord, dims: ChunkDims) -> Result<Vec<Tile>, WorldError>;
    fn spells(&self, identity: &Identity) -> Vec<u8>;
}

/// Starting character every name is given until real persistence exists.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CharacterTemplate {
    pub id: u32,
    pub position: Position,
    pub direction: Direction,
    pub experience: u32,
    pub level: u8,
    pub speed: u16,
    pub attack: u8,
    pub attack_slowness: u8,
    pub armor: u8,
    pub capacity: u32,
    pub health: u8,
    pub max_health: u8,
    pub mana: u16,
    pub max_mana: u16,
    pub outfit: Outfit,
    pub outfits: Vec<OutfitEntry>,
    pub mounts: Vec<OutfitEntry>,
    /// Slot order; missing trailing slots are empty.
    pub equipment: Vec<Option<Item>>,
    pub conditions: Vec<u8>,
    pub spells: Vec<u8>,
}

impl Default for CharacterTemplate {
    fn default() -> Self {
        Self {
            id: 1000,
            position: Position::new(100, 100, 7),
            direction: Direction::East,
            experience: 0,
            level: 1,
            speed: 220,
            attack: 1,
            attack_slowness: 0,
            armor: 0,
            capacity: 400,
            health: 150,
            max_health: 150,
            mana: 0,
            max_mana: 0,
            outfit: Outfit {
                id: 128,
                details: Some(OutfitDetails::default()),
                ..Outfit::default()
            },
            outfits: vec![OutfitEntry {
                id: 128,
                name: "Citizen".to_string(),
            }],
            mounts: Vec::new(),
            equipment: Vec::new(),
            conditions: Vec::new(),
            spells: Vec::new(),
        }
    }
}

impl CharacterTemplate {
    pub fn load(path: &Path) -> Result<Self, WorldError> {
        let data = std::fs::read_to_string(path).map_err(|source| WorldError::TemplateRead {
            path: path.to_path_buf(),
            source,
        })?;
        let template: CharacterTemplate =
            serde_yaml::from_str(&data).map_err(|source| WorldError::TemplateParse {
                path: path.to_path_buf(),
                source,
            })?;
        template.validate()?;
        Ok(template)
    }

    pub fn validate(&self) -> Result<(), WorldError> {
        if self.equipment.len() > EQUIPMENT_SLOTS {
            return Err(WorldError::InvalidTemplate(format!(
                "{} equipment slots given, at most {EQUIPMENT_SLOTS} exist",
                self.equipment.len()
            )));
        }
        if self.health > self.max_health || self.mana > self.max_mana {
            return Err(WorldError::InvalidTemplate(
                "current health/mana exceeds maximum".to_string(),
            ));
        }
        Ok(())
    }

    pub fn snapshot(&self, name: &str) -> PlayerSnapshot {
        let mut equipment = [None; EQUIPMENT_SLOTS];
        for (slot, item) in equipment.iter_mut().zip(&self.equipment) {
            *slot = *item;
        }
        PlayerSnapshot {
            id: self.id,
            name: name.to_string(),
            position: self.position,
            direction: self.direction,
            experience: self.experience,
            level: self.level,
            speed: self.speed,
            attack: self.attack,
            attack_slowness: self.attack_slowness,
            armor: self.armor,
            equipment,
            capacity: self.capacity,
            mounts: self.mounts.clone(),
            outfits: self.outfits.clone(),
            outfit: self.outfit.clone(),
            health: self.health,
            max_health: self.max_health,
            mana: self.mana,
            max_mana: self.max_mana,
            conditions: self.conditions.clone(),
        }
    }
}

/// Serves every character from one template over an empty map.
#[derive(Debug, Clone, Default)]
pub struct TemplateWorld {
    template: CharacterTemplate,
}

impl TemplateWorld {
    pub fn new(template: CharacterTemplate) -> Self {
        Self { template }
    }

    pub fn from_optional_file(path: Option<&Path>) -> Result<Self, WorldError> {
        match path {
            Some(path) => Ok(Self::new(CharacterTemplate::load(path)?)),
            None => Ok(Self::default()),
        }
    }

    pub fn template(&self) -> &CharacterTemplate {
        &self.template
    }
}

impl WorldProvider for TemplateWorld {
    fn player_snapshot(&self, identity: &Identity) -> Result<PlayerSnapshot, WorldError> {
        if identity.as_str().trim().is_empty() {
            return Err(WorldError::UnknownCharacter(identity.as_str().to_string()));
        }
        Ok(self.template.snapshot(identity.as_str()))
    }

    fn chunk_tiles(&self, _coord: &ChunkCoord, dims: ChunkDims) -> Result<Vec<Tile>, WorldError> {
        Ok(vec![Tile::default(); dims.tile_count()])
    }

    fn spells(&self, _identity: &Identity) -> Vec<u8> {
        self.template.spells.clone()
    }
}
