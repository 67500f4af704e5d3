use serde::{Deserialize, Serialize};

/// Continuous world coordinates inside one map.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance_squared(self, other: Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn distance(self, other: Position) -> f32 {
        self.distance_squared(other).sqrt()
    }

    /// Inclusive: a point exactly on the radius is in range.
    pub fn within(self, other: Position, radius: f32) -> bool {
        radius >= 0.0 && self.distance_squared(other) <= radius * radius
    }

    /// Moves at most `max_step` towards `target`, never overshooting it.
    pub fn approach(self, target: Position, max_step: f32) -> Position {
        let distance = self.distance(target);
        if distance <= max_step || distance <= f32::EPSILON {
            return target;
        }
        let ratio = max_step / distance;
        Position {
            x: self.x + (target.x - self.x) * ratio,
            y: self.y + (target.y - self.y) * ratio,
        }
    }
}
