//! Outbound frame assembly. Every builder is pure: the same inputs always
//! produce the same bytes.

use crate::config::GameOptions;
use crate::net::packet::{CodecError, Frame, PacketWriter};
use crate::protocol::dto::{ChunkData, Item, Outfit, OutfitEntry, PlayerSnapshot};
use crate::protocol::opcodes::ServerOpcode;
use crate::world::position::Position;

fn frame_writer(opcode: ServerOpcode, capacity: usize) -> PacketWriter {
    let mut writer = PacketWriter::with_capacity(capacity);
    writer.write_u8(opcode.as_u8());
    writer
}

pub fn write_position(writer: &mut PacketWriter, x: u16, y: u16, z: u16) {
    writer.write_u16_le(x);
    writer.write_u16_le(y);
    writer.write_u16_le(z);
}

pub fn write_item(writer: &mut PacketWriter, item: Option<&Item>) {
    match item {
        Some(item) => {
            writer.write_u16_le(item.client_item_id);
            writer.write_u8(item.count);
        }
        None => {
            writer.write_u16_le(0);
            writer.write_u8(0);
        }
    }
}

pub fn write_byte_list(writer: &mut PacketWriter, values: &[u8]) -> Result<(), CodecError> {
    writer.write_count(values.len())?;
    writer.write_bytes(values);
    Ok(())
}

pub fn write_outfit_list(
    writer: &mut PacketWriter,
    entries: &[OutfitEntry],
) -> Result<(), CodecError> {
    writer.write_count(entries.len())?;
    for entry in entries {
        writer.write_u16_le(entry.id);
        writer.write_string(&entry.name)?;
    }
    Ok(())
}

/// Writes a worn outfit. Clients without the mount/addon feature still
/// expect the five trailing bytes, zeroed.
pub fn write_outfit(writer: &mut PacketWriter, outfit: &Outfit, features_enabled: bool) {
    writer.write_u16_le(outfit.id);
    let details = outfit.details.unwrap_or_default();
    writer.write_u8(details.head);
    writer.write_u8(details.body);
    writer.write_u8(details.legs);
    writer.write_u8(details.feet);

    if features_enabled {
        writer.write_u16_le(outfit.mount);
        writer.write_bool(outfit.mounted);
        writer.write_bool(outfit.addon_one);
        writer.write_bool(outfit.addon_two);
    } else {
        writer.write_u16_le(0);
        writer.write_u8(0);
        writer.write_u8(0);
        writer.write_u8(0);
    }
}

pub fn server_data(options: &GameOptions) -> Result<Frame, CodecError> {
    let mut writer = frame_writer(ServerOpcode::SendServerData, 32 + options.server_version.len());
    writer.write_u16_le(options.world_width);
    writer.write_u16_le(options.world_height);
    writer.write_u8(options.world_depth);

    writer.write_u8(options.chunk_width);
    writer.write_u8(options.chunk_height);
    writer.write_u8(options.chunk_depth);

    writer.write_u8(options.tick_ms);
    writer.write_u16_le(options.clock_speed);
    writer.write_string(&options.server_version)?;
    writer.write_u16_le(options.client_version);
    Ok(writer.finish())
}

pub fn login_success(player: &PlayerSnapshot, features_enabled: bool) -> Result<Frame, CodecError> {
    let mut writer = frame_writer(ServerOpcode::LoginSuccess, 256);
    writer.write_u32_le(player.id);
    writer.write_string(&player.name)?;
    let Position { x, y, z } = player.position;
    write_position(&mut writer, x, y, u16::from(z));
    writer.write_u8(player.direction.to_byte());

    writer.write_u32_le(player.experience);
    writer.write_u8(player.level);
    writer.write_u16_le(player.speed);
    writer.write_u8(player.attack);
    writer.write_u8(player.attack_slowness);

    for slot in &player.equipment {
        write_item(&mut writer, slot.as_ref());
    }

    writer.write_u32_le(player.capacity);

    write_outfit_list(&mut writer, &player.mounts)?;
    write_outfit_list(&mut writer, &player.outfits)?;
    write_outfit(&mut writer, &player.outfit, features_enabled);

    writer.write_u8(player.health);
    writer.write_u8(player.max_health);
    writer.write_u16_le(player.mana);
    writer.write_u16_le(player.max_mana);

    write_byte_list(&mut writer, &player.conditions)?;
    Ok(writer.finish())
}

pub fn world_time(unix_seconds: u32) -> Frame {
    let mut writer = frame_writer(ServerOpcode::WorldTime, 5);
    writer.write_u32_le(unix_seconds);
    writer.finish()
}

pub fn write_spells(spell_ids: &[u8]) -> Result<Frame, CodecError> {
    let mut writer = frame_writer(ServerOpcode::WriteSpells, 2 + spell_ids.len());
    write_byte_list(&mut writer, spell_ids)?;
    Ok(writer.finish())
}

pub fn player_statistics(capacity: u32, attack: u8, armor: u8, speed: u16) -> Frame {
    let mut writer = frame_writer(ServerOpcode::PlayerStatistics, 9);
    writer.write_u32_le(capacity);
    writer.write_u8(attack);
    writer.write_u8(armor);
    writer.write_u16_le(speed);
    writer.finish()
}

pub fn write_chunk(chunk: &ChunkData) -> Frame {
    let mut writer = frame_writer(ServerOpcode::WriteChunk, 11 + chunk.tiles.len() * 4);
    writer.write_u32_le(chunk.coord.id);
    write_position(
        &mut writer,
        chunk.coord.sector_x,
        chunk.coord.sector_y,
        chunk.coord.sector_z,
    );
    for tile in &chunk.tiles {
        writer.write_u16_le(tile.tile_id);
        writer.write_u8(tile.flags);
        writer.write_u8(tile.zone);
    }
    writer.finish()
}
