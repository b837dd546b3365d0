use crate::world::position::Position;

/// Tile extent of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDims {
    pub width: u8,
    pub height: u8,
    pub depth: u8,
}

impl ChunkDims {
    pub fn tile_count(self) -> usize {
        usize::from(self.width) * usize::from(self.height) * usize::from(self.depth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkCoord {
    pub id: u32,
    pub sector_x: u16,
    pub sector_y: u16,
    pub sector_z: u16,
}

impl ChunkCoord {
    /// Locates the chunk a client at `position` is standing in. The sector
    /// origin is shifted diagonally by the floor offset inside the chunk, and
    /// depth only distinguishes surface (z < 8) from underground.
    ///
    /// Chunk dimensions must be non-zero; `GameOptions::validate` enforces it.
    pub fn for_position(
        position: Position,
        dims: ChunkDims,
        world_width: u16,
        world_height: u16,
    ) -> Self {
        let z_mod = u16::from(position.z % dims.depth);
        let origin_x = position.x.saturating_sub(z_mod);
        let origin_y = position.y.saturating_sub(z_mod);

        let sector_x = origin_x / u16::from(dims.width);
        let sector_y = origin_y / u16::from(dims.height);
        let sector_z: u16 = if position.is_underground() { 1 } else { 0 };

        let sectors_wide = u64::from(world_width / u16::from(dims.width));
        let sectors_high = u64::from(world_height / u16::from(dims.height));
        let id = u64::from(sector_x)
            + u64::from(sector_y) * sectors_wide
            + u64::from(sector_z) * sectors_wide * sectors_high;

        Self {
            id: id as u32,
            sector_x,
            sector_y,
            sector_z,
        }
    }
}
