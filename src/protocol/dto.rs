use serde::Deserialize;

use crate::protocol::chunk::ChunkCoord;
use crate::world::position::{Direction, Position};

pub const EQUIPMENT_SLOTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Item {
    pub client_item_id: u16,
    pub count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct OutfitDetails {
    pub head: u8,
    pub body: u8,
    pub legs: u8,
    pub feet: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Outfit {
    pub id: u16,
    pub details: Option<OutfitDetails>,
    pub mount: u16,
    pub mounted: bool,
    pub addon_one: bool,
    pub addon_two: bool,
}

impl Default for Outfit {
    fn default() -> Self {
        Self {
            id: 0,
            details: Some(OutfitDetails::default()),
            mount: 0,
            mounted: false,
            addon_one: false,
            addon_two: false,
        }
    }
}

/// Entry of the owned outfits or owned mounts list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutfitEntry {
    pub id: u16,
    pub name: String,
}

/// Everything the login sequence needs to describe one character. Built
/// fresh for every login and dropped once the frames are out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSnapshot {
    pub id: u32,
    pub name: String,
    pub position: Position,
    pub direction: Direction,
    pub experience: u32,
    pub level: u8,
    pub speed: u16,
    pub attack: u8,
    pub attack_slowness: u8,
    pub armor: u8,
    pub equipment: [Option<Item>; EQUIPMENT_SLOTS],
    pub capacity: u32,
    pub mounts: Vec<OutfitEntry>,
    pub outfits: Vec<OutfitEntry>,
    pub outfit: Outfit,
    pub health: u8,
    pub max_health: u8,
    pub mana: u16,
    pub max_mana: u16,
    pub conditions: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tile {
    pub tile_id: u16,
    pub flags: u8,
    pub zone: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub coord: ChunkCoord,
    pub tiles: Vec<Tile>,
}
