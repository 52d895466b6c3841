//! Per-tick transient collections
//!
//! Everything here lives for exactly one tick: gameplay pushes during the
//! update phase, every viewer reads during composition, and the scheduler
//! clears it once all buffers were flushed.

use crate::ws::protocol::{AirstrikeZone, Bullet, Emote, Explosion, KillMsg, PlayerInfo, Plane};

use super::objects::ObjectId;

#[derive(Debug, Default)]
pub struct TickEvents {
    pub bullets: Vec<Bullet>,
    pub explosions: Vec<Explosion>,
    pub emotes: Vec<Emote>,
    pub planes: Vec<Plane>,
    pub airstrike_zones: Vec<AirstrikeZone>,
    pub kills: Vec<KillMsg>,
    /// Players registered this tick, announced to every connection
    pub new_players: Vec<PlayerInfo>,
    pub deleted_player_ids: Vec<ObjectId>,
    pub kill_leader_changed: bool,
}

impl TickEvents {
    pub fn clear(&mut self) {
        self.bullets.clear();
        self.explosions.clear();
        self.emotes.clear();
        self.planes.clear();
        self.airstrike_zones.clear();
        self.kills.clear();
        self.new_players.clear();
        self.deleted_player_ids.clear();
        self.kill_leader_changed = false;
    }

    pub fn is_empty(&self) -> bool {
        self.bullets.is_empty()
            && self.explosions.is_empty()
            && self.emotes.is_empty()
            && self.planes.is_empty()
            && self.airstrike_zones.is_empty()
            && self.kills.is_empty()
            && self.new_players.is_empty()
            && self.deleted_player_ids.is_empty()
            && !self.kill_leader_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::Vec2;

    #[test]
    fn clear_empties_every_collection() {
        let mut events = TickEvents::default();
        events.explosions.push(Explosion {
            pos: Vec2::new(1.0, 1.0),
            explosion_type: 2,
            layer: 0,
        });
        events.deleted_player_ids.push(4);
        events.kill_leader_changed = true;
        assert!(!events.is_empty());

        events.clear();
        assert!(events.is_empty());
    }
}
