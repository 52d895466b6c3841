//! Explicit per-match world context
//!
//! Owns the object register, the spatial index and the per-tick transient
//! collections. Gameplay code mutates the world only through these methods so
//! that the grid and dirty state stay consistent in the same tick.

use std::collections::{BTreeMap, HashSet};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::ws::protocol::{KillLeader, MapIndicator, MapMsg, PlayerInfo, WORLD_EXTENT};

use super::events::TickEvents;
use super::gas::{Gas, GasConfig};
use super::grid::Grid;
use super::objects::{GameObject, ObjectData, ObjectId, ObjectKind, Obstacle};
use super::physics::{Collider, Vec2};
use super::player::PlayerState;
use super::register::{DirtyLevel, ObjectRegister, RegisterError};

/// Map indicators with a version bumped on every change
#[derive(Debug, Default)]
pub struct MapIndicators {
    entries: BTreeMap<u8, (MapIndicator, u32)>,
    next_version: u32,
}

impl MapIndicators {
    /// Place or update an indicator
    pub fn set(&mut self, indicator: MapIndicator) {
        self.next_version = self.next_version.wrapping_add(1);
        self.entries.insert(indicator.id, (indicator, self.next_version));
    }

    pub fn remove(&mut self, id: u8) -> Option<MapIndicator> {
        self.entries.remove(&id).map(|(ind, _)| ind)
    }

    pub fn get(&self, id: u8) -> Option<&MapIndicator> {
        self.entries.get(&id).map(|(ind, _)| ind)
    }

    /// `(indicator, version)` pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (&MapIndicator, u32)> {
        self.entries.values().map(|(ind, v)| (ind, *v))
    }
}

pub struct World {
    pub tick: u64,
    pub tick_rate: u32,
    pub width: f32,
    pub height: f32,
    pub register: ObjectRegister,
    pub grid: Grid,
    pub events: TickEvents,
    pub indicators: MapIndicators,
    pub gas: Gas,
    pub kill_leader: Option<KillLeader>,
    pub rng: ChaCha8Rng,
}

impl World {
    pub fn new(width: f32, height: f32, cell_size: f32, tick_rate: u32, seed: u64) -> Self {
        debug_assert!(width <= WORLD_EXTENT && height <= WORLD_EXTENT, "map exceeds the wire extent");
        let center = Vec2::new(width / 2.0, height / 2.0);
        Self {
            tick: 0,
            tick_rate,
            width,
            height,
            register: ObjectRegister::new(),
            grid: Grid::new(width, height, cell_size),
            events: TickEvents::default(),
            indicators: MapIndicators::default(),
            gas: Gas::new(GasConfig::for_map(width.max(height)), center),
            kill_leader: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn bounds(&self) -> Vec2 {
        Vec2::new(self.width, self.height)
    }

    /// Register a gameplay-created object, marked full-dirty and indexed
    pub fn register_new(&mut self, object: GameObject) -> Result<ObjectId, RegisterError> {
        let collider = object.collider;
        let id = self.register.insert(object)?;
        self.grid.insert(id, &collider);

        if let Some(info) = self.player_info(id) {
            self.events.new_players.push(info);
        }
        Ok(id)
    }

    /// Spawn static obstacles for every object of the map definition
    pub fn populate_from_map(&mut self, map: &MapMsg) -> Result<usize, RegisterError> {
        for obj in &map.objects {
            let data = ObjectData::Obstacle(Obstacle {
                obstacle_type: obj.object_type,
                ori: obj.ori,
                scale: obj.scale,
                health_t: 1.0,
                dead: false,
                door_open: false,
            });
            let collider = Collider::circle(obj.pos, 2.0 * obj.scale);
            self.register_new(GameObject::new(obj.pos, 0, collider, data))?;
        }
        Ok(map.objects.len())
    }

    pub fn mark_dirty(&mut self, id: ObjectId, level: DirtyLevel) {
        self.register.mark_dirty(id, level);
    }

    /// Remove an object from the world; its identifier is released later,
    /// once no viewer references it
    pub fn destroy(&mut self, id: ObjectId) -> Result<GameObject, RegisterError> {
        let object = self.register.destroy(id, self.tick)?;
        self.grid.remove(id);
        if object.kind() == ObjectKind::Player {
            self.events.deleted_player_ids.push(id);
        }
        debug!(id, kind = ?object.kind(), tick = self.tick, "Object destroyed");
        Ok(object)
    }

    /// Broadphase candidates overlapping `shape` (may contain false positives)
    pub fn query_overlap(&self, shape: &Collider) -> HashSet<ObjectId> {
        self.grid.intersect_collider(shape)
    }

    /// Move an object and re-index it; marks it part-dirty
    pub fn move_object(&mut self, id: ObjectId, pos: Vec2) -> Result<(), RegisterError> {
        let obj = self
            .register
            .get_mut(id)
            .ok_or(RegisterError::UnknownObject(id))?;
        obj.pos = pos;
        obj.collider = obj.collider.moved_to(pos);
        let collider = obj.collider;
        self.grid.update_position(id, &collider);
        self.register.mark_part_dirty(id);
        Ok(())
    }

    pub fn player(&self, id: ObjectId) -> Option<&PlayerState> {
        self.register.get(id).and_then(GameObject::player)
    }

    pub fn player_mut(&mut self, id: ObjectId) -> Option<&mut PlayerState> {
        self.register.get_mut(id).and_then(GameObject::player_mut)
    }

    pub fn is_alive_player(&self, id: ObjectId) -> bool {
        self.player(id).is_some_and(PlayerState::alive)
    }

    /// Ids of living players in ascending order
    pub fn alive_player_ids(&self) -> Vec<ObjectId> {
        self.register
            .iter()
            .filter(|o| o.player().is_some_and(PlayerState::alive))
            .map(|o| o.id)
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.register
            .iter()
            .filter(|o| o.player().is_some_and(PlayerState::alive))
            .count()
    }

    pub fn player_info(&self, id: ObjectId) -> Option<PlayerInfo> {
        self.player(id).map(|p| PlayerInfo {
            player_id: id,
            team_id: p.team_id,
            name: p.name.clone(),
        })
    }

    /// Every registered player, for a connection's first update
    pub fn all_player_infos(&self) -> Vec<PlayerInfo> {
        self.register
            .iter()
            .filter_map(|o| self.player_info(o.id))
            .collect()
    }

    /// Random position inside the world, keeping `margin` from the edges
    pub fn random_position(&mut self, margin: f32) -> Vec2 {
        let margin = margin.min(self.width / 2.0).min(self.height / 2.0);
        let x = if self.width - margin > margin {
            self.rng.gen_range(margin..self.width - margin)
        } else {
            self.width / 2.0
        };
        let y = if self.height - margin > margin {
            self.rng.gen_range(margin..self.height - margin)
        } else {
            self.height / 2.0
        };
        Vec2::new(x, y)
    }

    /// Recompute the player with the most kills; flags a change for this tick
    pub fn update_kill_leader(&mut self) {
        let leader = self
            .register
            .iter()
            .filter_map(|o| o.player().map(|p| (o.id, p)))
            .filter(|(_, p)| p.alive() && p.kills > 0)
            .max_by_key(|(id, p)| (p.kills, std::cmp::Reverse(*id)))
            .map(|(id, p)| KillLeader {
                id,
                kills: p.kills.min(u8::MAX as u32) as u8,
            });
        if leader != self.kill_leader {
            self.kill_leader = leader;
            self.events.kill_leader_changed = true;
        }
    }

    /// End-of-tick cleanup, after every buffer was flushed
    pub fn end_tick(&mut self) -> Vec<ObjectId> {
        self.register.clear_all_dirty();
        self.events.clear();
        self.gas.clear_dirty();
        self.register.release_pending(self.tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::objects::Loot;

    fn world() -> World {
        World::new(256.0, 256.0, 16.0, 30, 42)
    }

    fn loot_at(x: f32, y: f32) -> GameObject {
        GameObject::new(
            Vec2::new(x, y),
            0,
            Collider::circle(Vec2::ZERO, 1.0),
            ObjectData::Loot(Loot { loot_type: 1, count: 1 }),
        )
    }

    fn player_at(x: f32, y: f32, name: &str) -> GameObject {
        GameObject::new(
            Vec2::new(x, y),
            0,
            Collider::circle(Vec2::ZERO, 1.0),
            ObjectData::Player(Box::new(PlayerState::new(None, name.into(), 1, 0))),
        )
    }

    #[test]
    fn registered_objects_are_queryable() {
        let mut w = world();
        let id = w.register_new(loot_at(50.0, 50.0)).unwrap();
        assert!(w.register.is_full_dirty(id));
        assert!(w
            .query_overlap(&Collider::circle(Vec2::new(50.0, 50.0), 3.0))
            .contains(&id));
    }

    #[test]
    fn move_reindexes_and_marks_part_dirty() {
        let mut w = world();
        let id = w.register_new(loot_at(10.0, 10.0)).unwrap();
        w.register.clear_all_dirty();

        w.move_object(id, Vec2::new(200.0, 200.0)).unwrap();
        assert!(w.register.is_part_dirty(id));
        assert!(!w.register.is_full_dirty(id));
        assert!(!w
            .query_overlap(&Collider::circle(Vec2::new(10.0, 10.0), 2.0))
            .contains(&id));
        assert!(w
            .query_overlap(&Collider::circle(Vec2::new(200.0, 200.0), 2.0))
            .contains(&id));
        assert_eq!(
            w.move_object(999, Vec2::ZERO).unwrap_err(),
            RegisterError::UnknownObject(999)
        );
    }

    #[test]
    fn destroy_removes_from_grid_immediately() {
        let mut w = world();
        let id = w.register_new(player_at(30.0, 30.0, "p")).unwrap();
        assert_eq!(w.events.new_players.len(), 1);

        w.destroy(id).unwrap();
        assert!(!w.grid.contains(id));
        assert_eq!(w.events.deleted_player_ids, vec![id]);
        assert_eq!(w.register.pending_release(), &[id]);
    }

    #[test]
    fn end_tick_releases_after_destruction_tick() {
        let mut w = world();
        let id = w.register_new(loot_at(30.0, 30.0)).unwrap();
        w.tick = 4;
        w.destroy(id).unwrap();
        assert!(w.end_tick().is_empty());
        w.tick = 5;
        assert_eq!(w.end_tick(), vec![id]);
    }

    #[test]
    fn kill_leader_tracks_most_kills() {
        let mut w = world();
        let a = w.register_new(player_at(10.0, 10.0, "a")).unwrap();
        let b = w.register_new(player_at(20.0, 20.0, "b")).unwrap();
        w.update_kill_leader();
        assert_eq!(w.kill_leader, None);
        assert!(!w.events.kill_leader_changed);

        w.player_mut(b).unwrap().kills = 2;
        w.player_mut(a).unwrap().kills = 1;
        w.update_kill_leader();
        assert_eq!(w.kill_leader, Some(KillLeader { id: b, kills: 2 }));
        assert!(w.events.kill_leader_changed);
    }

    #[test]
    fn indicators_bump_version_on_change() {
        let mut ind = MapIndicators::default();
        let marker = MapIndicator {
            id: 1,
            dead: false,
            equipped: false,
            indicator_type: 3,
            pos: Vec2::new(5.0, 5.0),
        };
        ind.set(marker);
        let v1 = ind.iter().next().map(|(_, v)| v);
        ind.set(MapIndicator {
            equipped: true,
            ..marker
        });
        let v2 = ind.iter().next().map(|(_, v)| v);
        assert_ne!(v1, v2);
        assert!(ind.get(1).is_some_and(|m| m.equipped));
        assert!(ind.remove(1).is_some());
        assert!(ind.get(1).is_none());
    }

    #[test]
    fn map_objects_become_obstacles() {
        let mut w = world();
        let mut map = crate::game::snapshot::default_map(256, 256, 1);
        map.objects.push(crate::ws::protocol::MapObject {
            pos: Vec2::new(40.0, 40.0),
            scale: 1.0,
            object_type: 9,
            ori: 0,
        });
        assert_eq!(w.populate_from_map(&map).unwrap(), 1);
        assert_eq!(w.register.kind_of(1), Some(ObjectKind::Obstacle));
    }
}
