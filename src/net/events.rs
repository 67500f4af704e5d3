use crate::entities::creature::{CharacterId, EntityId, PresentationId, Relation, ShardId, TemplateId};
use crate::net::session::SessionId;
use crate::world::observer::Category;
use crate::world::position::Position;
use serde::{Deserialize, Serialize};

/// Structured state change handed to the transport. Byte layout is the
/// encoder's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorldEvent {
    PlayerAppear {
        character: CharacterId,
        name: String,
        position: Position,
        health_percent: u8,
    },
    PlayerDisappear {
        character: CharacterId,
    },
    PlayerMove {
        character: CharacterId,
        position: Position,
    },
    EntityAppear {
        category: Category,
        presentation_id: PresentationId,
        template: TemplateId,
        visual: u16,
        position: Position,
        health_percent: u8,
        relation: Relation,
    },
    EntityDisappear {
        category: Category,
        presentation_id: PresentationId,
    },
    EntityMove {
        presentation_id: PresentationId,
        position: Position,
    },
    DropAppear {
        presentation_id: PresentationId,
        position: Position,
        item: u32,
        count: u16,
        claimed_by_other: bool,
    },
    EntityDamaged {
        presentation_id: PresentationId,
        amount: u32,
        health_percent: u8,
    },
    CharacterDamaged {
        character: CharacterId,
        amount: u32,
        health_percent: u8,
    },
    EntityDied {
        presentation_id: PresentationId,
    },
    CharacterDied {
        character: CharacterId,
    },
    KillCredit {
        killer: CharacterId,
        experience: u32,
    },
}

/// What a `NearObserversOf` scope is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Entity { category: Category, id: EntityId },
    Character(CharacterId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    NearObserversOf(Subject),
    AllInShard(ShardId),
    SingleSession(SessionId),
    Unscoped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    #[default]
    Local,
    /// Also forwarded through the inter-process bus.
    Cluster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub event: WorldEvent,
    pub scope: Scope,
    #[serde(default)]
    pub routing: Routing,
}

impl Message {
    pub fn local(event: WorldEvent, scope: Scope) -> Self {
        Self {
            event,
            scope,
            routing: Routing::Local,
        }
    }

    pub fn cluster(event: WorldEvent, scope: Scope) -> Self {
        Self {
            event,
            scope,
            routing: Routing::Cluster,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_survive_json() {
        let message = Message::cluster(
            WorldEvent::DropAppear {
                presentation_id: PresentationId(3),
                position: Position::new(1.0, 2.0),
                item: 3031,
                count: 7,
                claimed_by_other: true,
            },
            Scope::NearObserversOf(Subject::Entity {
                category: Category::Drops,
                id: EntityId(9),
            }),
        );
        let json = serde_json::to_string(&message).expect("encode");
        assert!(json.contains("\"type\":\"drop_appear\""));
        let decoded: Message = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn routing_defaults_to_local() {
        let json = r#"{"event":{"type":"player_disappear","character":4},"scope":"unscoped"}"#;
        let decoded: Message = serde_json::from_str(json).expect("decode");
        assert_eq!(decoded.routing, Routing::Local);
        assert_eq!(decoded.scope, Scope::Unscoped);
    }
}
