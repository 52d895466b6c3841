//! Gameplay callbacks and the bundled arena rules
//!
//! The tick scheduler only knows the [`Gameplay`] trait. [`ArenaRules`] is a
//! small reference ruleset: input-driven movement, hitscan bullets resolved
//! through the spatial index, dead bodies and gas damage. Balance values are
//! placeholders.

use tracing::{info, warn};
use uuid::Uuid;

use crate::util::time::tick_delta;
use crate::ws::protocol::{Bullet, KillMsg};

use super::gas::GasMode;
use super::objects::{DeadBody, GameObject, ObjectData, ObjectId};
use super::physics::{Aabb, Collider, MoveStats, PhysicsSystem, Vec2};
use super::player::PlayerState;
use super::register::{DirtyLevel, RegisterError};
use super::world::World;

/// Gameplay hooks driven by the tick scheduler
pub trait Gameplay: Send {
    /// Spawn the avatar of a newly joined connection
    fn on_join(&mut self, world: &mut World, conn_id: Uuid, name: &str) -> Result<ObjectId, RegisterError>;

    /// The connection controlling `player_id` went away
    fn on_leave(&mut self, world: &mut World, player_id: ObjectId);

    /// The match left its waiting phase
    fn on_start(&mut self, world: &mut World);

    /// One simulation step; runs before any viewer is composed
    fn update(&mut self, world: &mut World);
}

const SPAWN_ATTEMPTS: usize = 16;

/// Weapon tuning
#[derive(Debug, Clone, Copy)]
pub struct WeaponStats {
    /// Damage per hit
    pub damage: f32,
    /// Hitscan range in world units
    pub range: f32,
    /// Cooldown between shots (seconds)
    pub cooldown: f32,
    pub bullet_type: u16,
}

impl Default for WeaponStats {
    fn default() -> Self {
        Self {
            damage: 20.0,
            range: 60.0,
            cooldown: 0.25,
            bullet_type: 1,
        }
    }
}

/// Damage sources reported in the kill feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DamageType {
    Player = 0,
    Gas = 1,
    Disconnect = 2,
}

/// Hit result from a single hitscan shot
#[derive(Debug, Clone, Copy)]
pub struct HitResult {
    pub shooter_id: ObjectId,
    pub target_id: ObjectId,
    pub distance: f32,
}

#[derive(Debug, Default)]
pub struct ArenaRules {
    pub move_stats: MoveStats,
    pub weapon: WeaponStats,
}

impl ArenaRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Random free spot; gives up on avoiding overlaps after a few tries
    fn spawn_position(&self, world: &mut World) -> Vec2 {
        let margin = self.move_stats.radius * 4.0;
        let mut pos = world.random_position(margin);
        for _ in 1..SPAWN_ATTEMPTS {
            let shape = Collider::circle(pos, self.move_stats.radius);
            let blocked = world
                .query_overlap(&shape)
                .into_iter()
                .any(|id| world.register.get(id).is_some_and(|o| o.collider.intersects(&shape)));
            if !blocked {
                break;
            }
            pos = world.random_position(margin);
        }
        pos
    }

    fn move_players(&self, world: &mut World, ids: &[ObjectId]) {
        let bounds = world.bounds();
        for &id in ids {
            let Some(obj) = world.register.get_mut(id) else {
                continue;
            };
            let pos = obj.pos;
            let Some(player) = obj.player_mut() else {
                continue;
            };
            let input = player.current_input.clone();

            let aim = input.aim_dir.normalize_or(player.dir);
            let turned = aim != player.dir;
            player.dir = aim;

            let next = if input.move_dir == Vec2::ZERO {
                pos
            } else {
                PhysicsSystem::step_position(pos, input.move_dir, &self.move_stats, world.tick_rate, bounds)
            };

            if next != pos {
                if let Err(e) = world.move_object(id, next) {
                    warn!(id, error = %e, "Failed to move player");
                }
            } else if turned {
                world.mark_dirty(id, DirtyLevel::Part);
            }
        }
    }

    fn fire_weapons(&self, world: &mut World, ids: &[ObjectId]) -> Vec<HitResult> {
        let dt = tick_delta(world.tick_rate);
        let mut hits = Vec::new();

        for &id in ids {
            let Some(obj) = world.register.get_mut(id) else {
                continue;
            };
            let (pos, layer) = (obj.pos, obj.layer);
            let Some(player) = obj.player_mut() else {
                continue;
            };
            player.weapon_cooldown = (player.weapon_cooldown - dt).max(0.0);
            if !player.current_input.shoot || player.weapon_cooldown > 0.0 {
                continue;
            }
            player.weapon_cooldown = self.weapon.cooldown;
            player.shots_fired += 1;
            let dir = player.dir.normalize_or(Vec2::new(1.0, 0.0));

            let hit = self.hitscan(world, id, pos, dir);
            let distance = hit.map(|h| h.distance).unwrap_or(self.weapon.range);
            world.events.bullets.push(Bullet {
                player_id: id,
                pos,
                dir,
                bullet_type: self.weapon.bullet_type,
                layer,
                distance,
                has_special_fx: false,
            });
            hits.extend(hit);
        }
        hits
    }

    /// Nearest living player along the shot, found through the grid
    fn hitscan(&self, world: &World, shooter: ObjectId, origin: Vec2, dir: Vec2) -> Option<HitResult> {
        let end = origin + dir * self.weapon.range;
        let swept = Collider::Rect(Aabb::new(origin, end));
        let mut best: Option<HitResult> = None;

        for id in world.query_overlap(&swept) {
            if id == shooter || !world.is_alive_player(id) {
                continue;
            }
            let Some(target) = world.register.get(id) else {
                continue;
            };
            let Collider::Circle { center, radius } = target.collider else {
                continue;
            };
            let Some(distance) = PhysicsSystem::ray_circle(origin, dir, self.weapon.range, center, radius) else {
                continue;
            };
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(HitResult {
                    shooter_id: shooter,
                    target_id: id,
                    distance,
                });
            }
        }
        best
    }

    fn apply_hits(&self, world: &mut World, hits: Vec<HitResult>) {
        for hit in hits {
            if let Some(shooter) = world.player_mut(hit.shooter_id) {
                shooter.shots_hit += 1;
                shooter.damage_dealt += self.weapon.damage;
            }
            damage_player(world, hit.target_id, self.weapon.damage, Some(hit.shooter_id), DamageType::Player);
        }
    }

    fn apply_gas_damage(&self, world: &mut World, ids: &[ObjectId]) {
        let damage = world.gas.damage_per_second() * tick_delta(world.tick_rate);
        if damage <= 0.0 {
            return;
        }
        let outside: Vec<ObjectId> = ids
            .iter()
            .copied()
            .filter(|&id| world.register.get(id).is_some_and(|o| world.gas.is_outside(o.pos)))
            .collect();
        for id in outside {
            damage_player(world, id, damage, None, DamageType::Gas);
        }
    }
}

/// Damage a player; on death marks it full-dirty, drops a body and
/// queues the kill feed entry
pub fn damage_player(
    world: &mut World,
    target_id: ObjectId,
    damage: f32,
    source: Option<ObjectId>,
    damage_type: DamageType,
) {
    let tick = world.tick;
    let Some(target) = world.player_mut(target_id) else {
        return;
    };
    if !target.apply_damage(damage, source, tick) {
        world.mark_dirty(target_id, DirtyLevel::Part);
        return;
    }

    world.mark_dirty(target_id, DirtyLevel::Full);
    let killer_kills = match source.and_then(|id| world.player_mut(id)) {
        Some(killer) => {
            killer.kills += 1;
            killer.kills.min(u8::MAX as u32) as u8
        }
        None => 0,
    };
    world.events.kills.push(KillMsg {
        damage_type: damage_type as u8,
        target_id,
        killer_id: source.unwrap_or(0),
        killed: true,
        killer_kills,
    });

    if let Some(obj) = world.register.get(target_id) {
        let body = GameObject::new(
            obj.pos,
            obj.layer,
            Collider::circle(obj.pos, 1.0),
            ObjectData::DeadBody(DeadBody { player_id: target_id }),
        );
        if let Err(e) = world.register_new(body) {
            warn!(target_id, error = %e, "No identifier left for dead body");
        }
    }
    world.update_kill_leader();
    info!(target_id, killer_id = ?source, damage_type = ?damage_type, "Player killed");
}

impl Gameplay for ArenaRules {
    fn on_join(&mut self, world: &mut World, conn_id: Uuid, name: &str) -> Result<ObjectId, RegisterError> {
        let pos = self.spawn_position(world);
        let state = PlayerState::new(Some(conn_id), name.to_string(), 1, world.tick);
        world.register_new(GameObject::new(
            pos,
            0,
            Collider::circle(pos, self.move_stats.radius),
            ObjectData::Player(Box::new(state)),
        ))
    }

    fn on_leave(&mut self, world: &mut World, player_id: ObjectId) {
        if world.is_alive_player(player_id) {
            damage_player(world, player_id, f32::MAX, None, DamageType::Disconnect);
        }
        if let Err(e) = world.destroy(player_id) {
            warn!(player_id, error = %e, "Avatar already gone on leave");
        }
    }

    fn on_start(&mut self, world: &mut World) {
        if world.gas.mode == GasMode::Inactive {
            world.gas.activate(&mut world.rng);
        }
    }

    fn update(&mut self, world: &mut World) {
        let dt = tick_delta(world.tick_rate);
        world.gas.advance(dt, &mut world.rng);

        let ids = world.alive_player_ids();
        self.move_players(world, &ids);
        let hits = self.fire_weapons(world, &ids);
        self.apply_hits(world, hits);

        let ids = world.alive_player_ids();
        self.apply_gas_damage(world, &ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::objects::ObjectKind;
    use crate::game::TickInput;

    fn world() -> World {
        World::new(512.0, 512.0, 16.0, 30, 5)
    }

    fn spawn(world: &mut World, rules: &mut ArenaRules, x: f32, y: f32) -> ObjectId {
        let id = rules.on_join(world, Uuid::new_v4(), "p").unwrap();
        world.move_object(id, Vec2::new(x, y)).unwrap();
        id
    }

    #[test]
    fn movement_follows_input_and_marks_part_dirty() {
        let mut w = world();
        let mut rules = ArenaRules::new();
        let id = spawn(&mut w, &mut rules, 100.0, 100.0);
        w.register.clear_all_dirty();

        w.player_mut(id).unwrap().current_input = TickInput {
            move_dir: Vec2::new(1.0, 0.0),
            ..Default::default()
        };
        rules.update(&mut w);
        let pos = w.register.get(id).unwrap().pos;
        assert!((pos.x - (100.0 + 12.0 / 30.0)).abs() < 1e-3);
        assert!(w.register.is_part_dirty(id));
        assert!(!w.register.is_full_dirty(id));
    }

    #[test]
    fn idle_players_stay_clean() {
        let mut w = world();
        let mut rules = ArenaRules::new();
        let id = spawn(&mut w, &mut rules, 100.0, 100.0);
        w.register.clear_all_dirty();
        rules.update(&mut w);
        assert!(!w.register.is_part_dirty(id));
    }

    #[test]
    fn hitscan_damages_nearest_target_only() {
        let mut w = world();
        let mut rules = ArenaRules::new();
        let shooter = spawn(&mut w, &mut rules, 100.0, 100.0);
        let near = spawn(&mut w, &mut rules, 110.0, 100.0);
        let far = spawn(&mut w, &mut rules, 120.0, 100.0);

        w.player_mut(shooter).unwrap().current_input = TickInput {
            aim_dir: Vec2::new(1.0, 0.0),
            shoot: true,
            ..Default::default()
        };
        rules.update(&mut w);

        assert_eq!(w.events.bullets.len(), 1);
        assert!((w.events.bullets[0].distance - 9.0).abs() < 1e-3);
        assert_eq!(w.player(near).unwrap().health, 80.0);
        assert_eq!(w.player(far).unwrap().health, 100.0);
        assert_eq!(w.player(shooter).unwrap().shots_hit, 1);
    }

    #[test]
    fn lethal_hit_spawns_body_and_kill_feed() {
        let mut w = world();
        let mut rules = ArenaRules::new();
        let shooter = spawn(&mut w, &mut rules, 100.0, 100.0);
        let target = spawn(&mut w, &mut rules, 105.0, 100.0);
        w.player_mut(target).unwrap().health = 10.0;
        w.register.clear_all_dirty();

        damage_player(&mut w, target, 20.0, Some(shooter), DamageType::Player);

        assert!(!w.is_alive_player(target));
        assert!(w.register.is_full_dirty(target));
        assert_eq!(w.events.kills.len(), 1);
        assert_eq!(w.events.kills[0].killer_id, shooter);
        assert_eq!(w.events.kills[0].killer_kills, 1);
        assert!(w.register.iter().any(|o| o.kind() == ObjectKind::DeadBody));
        assert_eq!(w.kill_leader.map(|k| k.id), Some(shooter));
    }

    #[test]
    fn spawns_avoid_occupied_spots() {
        let mut w = World::new(16.0, 16.0, 16.0, 30, 1);
        let mut rules = ArenaRules::new();
        let blocker = GameObject::new(
            Vec2::new(4.0, 8.0),
            0,
            Collider::circle(Vec2::ZERO, 1.5),
            ObjectData::DeadBody(DeadBody { player_id: 0 }),
        );
        w.register_new(blocker).unwrap();

        for _ in 0..5 {
            let id = rules.on_join(&mut w, Uuid::new_v4(), "p").unwrap();
            let pos = w.register.get(id).unwrap().pos;
            assert!(pos.distance(Vec2::new(4.0, 8.0)) > 2.5);
            rules.on_leave(&mut w, id);
        }
    }

    #[test]
    fn leaving_destroys_the_avatar() {
        let mut w = world();
        let mut rules = ArenaRules::new();
        let id = spawn(&mut w, &mut rules, 100.0, 100.0);
        rules.on_leave(&mut w, id);
        assert!(!w.register.contains(id));
        assert!(w.events.deleted_player_ids.contains(&id));
        assert_eq!(w.events.kills[0].damage_type, DamageType::Disconnect as u8);
    }

    #[test]
    fn gas_hurts_players_outside_after_start() {
        let mut w = world();
        let mut rules = ArenaRules::new();
        let id = spawn(&mut w, &mut rules, 2.0, 2.0);
        rules.update(&mut w);
        assert_eq!(w.player(id).unwrap().health, 100.0);

        rules.on_start(&mut w);
        assert_eq!(w.gas.mode, GasMode::Waiting);
        w.gas.current_rad = 50.0;
        rules.update(&mut w);
        assert!(w.player(id).unwrap().health < 100.0);
    }
}
