use crate::net::events::WorldEvent;
use crate::net::packet::PacketWriter;
use crate::world::position::Position;

/// Turns structured events into transport frames.
pub trait EventEncoder: Send + Sync {
    fn encode(&self, event: &WorldEvent) -> Vec<u8>;
}

pub const OP_PLAYER_APPEAR: u8 = 0x61;
pub const OP_PLAYER_DISAPPEAR: u8 = 0x62;
pub const OP_PLAYER_MOVE: u8 = 0x63;
pub const OP_ENTITY_APPEAR: u8 = 0x6a;
pub const OP_ENTITY_DISAPPEAR: u8 = 0x6b;
pub const OP_ENTITY_MOVE: u8 = 0x6c;
pub const OP_DROP_APPEAR: u8 = 0x70;
pub const OP_ENTITY_DAMAGED: u8 = 0x84;
pub const OP_CHARACTER_DAMAGED: u8 = 0x85;
pub const OP_ENTITY_DIED: u8 = 0x86;
pub const OP_CHARACTER_DIED: u8 = 0x87;
pub const OP_KILL_CREDIT: u8 = 0x88;

/// Default opcode-prefixed little-endian layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketEncoder;

fn write_position(writer: &mut PacketWriter, position: Position) {
    writer.write_f32_le(position.x);
    writer.write_f32_le(position.y);
}

impl EventEncoder for PacketEncoder {
    fn encode(&self, event: &WorldEvent) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(24);
        match event {
            WorldEvent::PlayerAppear {
                character,
                name,
                position,
                health_percent,
            } => {
                writer.write_u8(OP_PLAYER_APPEAR);
                writer.write_u32_le(character.0);
                writer.write_string_str(name);
                write_position(&mut writer, *position);
                writer.write_u8(*health_percent);
            }
            WorldEvent::PlayerDisappear { character } => {
                writer.write_u8(OP_PLAYER_DISAPPEAR);
                writer.write_u32_le(character.0);
            }
            WorldEvent::PlayerMove {
                character,
                position,
            } => {
                writer.write_u8(OP_PLAYER_MOVE);
                writer.write_u32_le(character.0);
                write_position(&mut writer, *position);
            }
            WorldEvent::EntityAppear {
                category,
                presentation_id,
                template,
                visual,
                position,
                health_percent,
                relation,
            } => {
                writer.write_u8(OP_ENTITY_APPEAR);
                writer.write_u8(category.code());
                writer.write_u16_le(presentation_id.0);
                writer.write_u32_le(template.0);
                writer.write_u16_le(*visual);
                write_position(&mut writer, *position);
                writer.write_u8(*health_percent);
                writer.write_u8(relation.code());
            }
            WorldEvent::EntityDisappear {
                category,
                presentation_id,
            } => {
                writer.write_u8(OP_ENTITY_DISAPPEAR);
                writer.write_u8(category.code());
                writer.write_u16_le(presentation_id.0);
            }
            WorldEvent::EntityMove {
                presentation_id,
                position,
            } => {
                writer.write_u8(OP_ENTITY_MOVE);
                writer.write_u16_le(presentation_id.0);
                write_position(&mut writer, *position);
            }
            WorldEvent::DropAppear {
                presentation_id,
                position,
                item,
                count,
                claimed_by_other,
            } => {
                writer.write_u8(OP_DROP_APPEAR);
                writer.write_u16_le(presentation_id.0);
                write_position(&mut writer, *position);
                writer.write_u32_le(*item);
                writer.write_u16_le(*count);
                writer.write_u8(u8::from(*claimed_by_other));
            }
            WorldEvent::EntityDamaged {
                presentation_id,
                amount,
                health_percent,
            } => {
                writer.write_u8(OP_ENTITY_DAMAGED);
                writer.write_u16_le(presentation_id.0);
                writer.write_u32_le(*amount);
                writer.write_u8(*health_percent);
            }
            WorldEvent::CharacterDamaged {
                character,
                amount,
                health_percent,
            } => {
                writer.write_u8(OP_CHARACTER_DAMAGED);
                writer.write_u32_le(character.0);
                writer.write_u32_le(*amount);
                writer.write_u8(*health_percent);
            }
            WorldEvent::EntityDied { presentation_id } => {
                writer.write_u8(OP_ENTITY_DIED);
                writer.write_u16_le(presentation_id.0);
            }
            WorldEvent::CharacterDied { character } => {
                writer.write_u8(OP_CHARACTER_DIED);
                writer.write_u32_le(character.0);
            }
            WorldEvent::KillCredit { killer, experience } => {
                writer.write_u8(OP_KILL_CREDIT);
                writer.write_u32_le(killer.0);
                writer.write_u32_le(*experience);
            }
        }
        writer.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::creature::{CharacterId, PresentationId, Relation, TemplateId};
    use crate::net::packet::PacketReader;
    use crate::world::observer::Category;

    #[test]
    fn entity_appear_layout() {
        let bytes = PacketEncoder.encode(&WorldEvent::EntityAppear {
            category: Category::Monsters,
            presentation_id: PresentationId(0x0102),
            template: TemplateId(5),
            visual: 9,
            position: Position::new(3.0, 4.0),
            health_percent: 80,
            relation: Relation::Hostile,
        });
        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_u8(), Some(OP_ENTITY_APPEAR));
        assert_eq!(reader.read_u8(), Some(Category::Monsters.code()));
        assert_eq!(reader.read_u16_le(), Some(0x0102));
        assert_eq!(reader.read_u32_le(), Some(5));
        assert_eq!(reader.read_u16_le(), Some(9));
        assert_eq!(reader.read_f32_le(), Some(3.0));
        assert_eq!(reader.read_f32_le(), Some(4.0));
        assert_eq!(reader.read_u8(), Some(80));
        assert_eq!(reader.read_u8(), Some(Relation::Hostile.code()));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn claimed_drop_carries_flag() {
        let bytes = PacketEncoder.encode(&WorldEvent::DropAppear {
            presentation_id: PresentationId(1),
            position: Position::new(0.0, 0.0),
            item: 7,
            count: 2,
            claimed_by_other: true,
        });
        assert_eq!(bytes[0], OP_DROP_APPEAR);
        assert_eq!(bytes.last(), Some(&1));
    }

    #[test]
    fn player_appear_carries_name() {
        let bytes = PacketEncoder.encode(&WorldEvent::PlayerAppear {
            character: CharacterId(12),
            name: "Aldo".to_string(),
            position: Position::new(1.0, 1.0),
            health_percent: 100,
        });
        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_u8(), Some(OP_PLAYER_APPEAR));
        assert_eq!(reader.read_u32_le(), Some(12));
        assert_eq!(reader.read_string_lossy().as_deref(), Some("Aldo"));
    }
}
