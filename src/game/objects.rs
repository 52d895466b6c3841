//! World object kinds and their wire records
//!
//! Every kind has a "part" field set (mutable state, sent as a patch) and a
//! "full" field set (identity and rarely changing state). A full record on the
//! wire is the part set followed by the full set.

use crate::ws::bitstream::{BitReader, BitStream};
use crate::ws::protocol::{read_map_pos, write_map_pos, ProtocolError};

use super::physics::{Collider, Vec2};
use super::player::PlayerState;

/// Identifier of a live world object (16 bits on the wire, 0 is never allocated)
pub type ObjectId = u16;

/// Closed set of object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Player = 1,
    Obstacle = 2,
    Loot = 3,
    DeadBody = 5,
    Building = 6,
    Structure = 7,
    Decal = 8,
    Projectile = 9,
    Smoke = 10,
    Airdrop = 11,
}

impl ObjectKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => ObjectKind::Player,
            2 => ObjectKind::Obstacle,
            3 => ObjectKind::Loot,
            5 => ObjectKind::DeadBody,
            6 => ObjectKind::Building,
            7 => ObjectKind::Structure,
            8 => ObjectKind::Decal,
            9 => ObjectKind::Projectile,
            10 => ObjectKind::Smoke,
            11 => ObjectKind::Airdrop,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Obstacle {
    pub obstacle_type: u16,
    pub ori: u8,
    pub scale: f32,
    pub health_t: f32,
    pub dead: bool,
    pub door_open: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Building {
    pub building_type: u16,
    pub ori: u8,
    pub ceiling_seen: bool,
    pub occupied: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Structure {
    pub structure_type: u16,
    pub ori: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Loot {
    pub loot_type: u16,
    pub count: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decal {
    pub decal_type: u16,
    pub ori: u8,
    pub scale: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeadBody {
    pub player_id: ObjectId,
}

/// Thrown object in flight (grenades and the like)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projectile {
    pub projectile_type: u16,
    pub pos_z: f32,
    pub dir: Vec2,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Smoke {
    pub radius: f32,
    pub interior: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Airdrop {
    pub fall_t: f32,
    pub landed: bool,
}

/// Kind-specific object state
#[derive(Debug, Clone)]
pub enum ObjectData {
    Player(Box<PlayerState>),
    Obstacle(Obstacle),
    Building(Building),
    Structure(Structure),
    Loot(Loot),
    Decal(Decal),
    DeadBody(DeadBody),
    Projectile(Projectile),
    Smoke(Smoke),
    Airdrop(Airdrop),
}

impl ObjectData {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectData::Player(_) => ObjectKind::Player,
            ObjectData::Obstacle(_) => ObjectKind::Obstacle,
            ObjectData::Building(_) => ObjectKind::Building,
            ObjectData::Structure(_) => ObjectKind::Structure,
            ObjectData::Loot(_) => ObjectKind::Loot,
            ObjectData::Decal(_) => ObjectKind::Decal,
            ObjectData::DeadBody(_) => ObjectKind::DeadBody,
            ObjectData::Projectile(_) => ObjectKind::Projectile,
            ObjectData::Smoke(_) => ObjectKind::Smoke,
            ObjectData::Airdrop(_) => ObjectKind::Airdrop,
        }
    }

    /// Default-valued data of the given kind, filled in by the wire readers
    pub fn empty(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Player => ObjectData::Player(Box::default()),
            ObjectKind::Obstacle => ObjectData::Obstacle(Obstacle::default()),
            ObjectKind::Building => ObjectData::Building(Building::default()),
            ObjectKind::Structure => ObjectData::Structure(Structure::default()),
            ObjectKind::Loot => ObjectData::Loot(Loot::default()),
            ObjectKind::Decal => ObjectData::Decal(Decal::default()),
            ObjectKind::DeadBody => ObjectData::DeadBody(DeadBody::default()),
            ObjectKind::Projectile => ObjectData::Projectile(Projectile::default()),
            ObjectKind::Smoke => ObjectData::Smoke(Smoke::default()),
            ObjectKind::Airdrop => ObjectData::Airdrop(Airdrop::default()),
        }
    }
}

/// A world object record
#[derive(Debug, Clone)]
pub struct GameObject {
    pub id: ObjectId,
    pub pos: Vec2,
    pub layer: u8,
    pub collider: Collider,
    pub data: ObjectData,
}

const LAYER_BITS: u32 = 2;
const ORI_BITS: u32 = 2;

impl GameObject {
    /// New unregistered object; the register assigns the identifier
    pub fn new(pos: Vec2, layer: u8, collider: Collider, data: ObjectData) -> Self {
        Self {
            id: 0,
            pos,
            layer,
            collider: collider.moved_to(pos),
            data,
        }
    }

    /// Client-side mirror of an object known only by id and kind
    pub fn placeholder(id: ObjectId, kind: ObjectKind) -> Self {
        Self {
            id,
            pos: Vec2::ZERO,
            layer: 0,
            collider: Collider::circle(Vec2::ZERO, 0.0),
            data: ObjectData::empty(kind),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.data.kind()
    }

    pub fn player(&self) -> Option<&PlayerState> {
        match &self.data {
            ObjectData::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn player_mut(&mut self) -> Option<&mut PlayerState> {
        match &mut self.data {
            ObjectData::Player(p) => Some(p),
            _ => None,
        }
    }

    pub fn serialize_part(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        match &self.data {
            ObjectData::Player(p) => {
                write_map_pos(s, self.pos)?;
                s.write_unit_vec(p.dir, 8)?;
            }
            ObjectData::Obstacle(o) => {
                write_map_pos(s, self.pos)?;
                s.write_bits(o.ori as u32, ORI_BITS)?;
                s.write_float(o.scale, 0.125, 2.5, 8)?;
            }
            ObjectData::Building(b) => {
                s.write_bool(b.ceiling_seen)?;
                s.write_bool(b.occupied)?;
            }
            ObjectData::Structure(_) | ObjectData::Decal(_) => {}
            ObjectData::Loot(_) | ObjectData::DeadBody(_) => {
                write_map_pos(s, self.pos)?;
            }
            ObjectData::Projectile(p) => {
                write_map_pos(s, self.pos)?;
                s.write_float(p.pos_z, 0.0, 32.0, 10)?;
                s.write_unit_vec(p.dir, 7)?;
            }
            ObjectData::Smoke(sm) => {
                write_map_pos(s, self.pos)?;
                s.write_float(sm.radius, 0.0, 16.0, 8)?;
            }
            ObjectData::Airdrop(a) => {
                s.write_float(a.fall_t, 0.0, 1.0, 7)?;
                s.write_bool(a.landed)?;
            }
        }
        Ok(())
    }

    pub fn serialize_full(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        match &self.data {
            ObjectData::Player(p) => {
                s.write_bits(self.layer as u32, LAYER_BITS)?;
                s.write_bool(p.dead)?;
                s.write_u8(p.team_id)?;
            }
            ObjectData::Obstacle(o) => {
                s.write_float(o.health_t, 0.0, 1.0, 8)?;
                s.write_u16(o.obstacle_type)?;
                s.write_bits(self.layer as u32, LAYER_BITS)?;
                s.write_bool(o.dead)?;
                s.write_bool(o.door_open)?;
            }
            ObjectData::Building(b) => {
                write_map_pos(s, self.pos)?;
                s.write_bits(b.ori as u32, ORI_BITS)?;
                s.write_bits(self.layer as u32, LAYER_BITS)?;
                s.write_u16(b.building_type)?;
            }
            ObjectData::Structure(st) => {
                write_map_pos(s, self.pos)?;
                s.write_bits(st.ori as u32, ORI_BITS)?;
                s.write_u16(st.structure_type)?;
                s.write_bits(self.layer as u32, LAYER_BITS)?;
            }
            ObjectData::Loot(l) => {
                s.write_u16(l.loot_type)?;
                s.write_u8(l.count)?;
                s.write_bits(self.layer as u32, LAYER_BITS)?;
            }
            ObjectData::Decal(d) => {
                write_map_pos(s, self.pos)?;
                s.write_float(d.scale, 0.125, 2.5, 8)?;
                s.write_u16(d.decal_type)?;
                s.write_bits(d.ori as u32, ORI_BITS)?;
                s.write_bits(self.layer as u32, LAYER_BITS)?;
            }
            ObjectData::DeadBody(db) => {
                s.write_bits(self.layer as u32, LAYER_BITS)?;
                s.write_u16(db.player_id)?;
            }
            ObjectData::Projectile(p) => {
                s.write_u16(p.projectile_type)?;
                s.write_bits(self.layer as u32, LAYER_BITS)?;
            }
            ObjectData::Smoke(sm) => {
                s.write_bits(self.layer as u32, LAYER_BITS)?;
                s.write_bits(sm.interior as u32, 6)?;
            }
            ObjectData::Airdrop(_) => {
                write_map_pos(s, self.pos)?;
            }
        }
        Ok(())
    }

    pub fn deserialize_part(&mut self, r: &mut BitReader<'_>) -> Result<(), ProtocolError> {
        match &mut self.data {
            ObjectData::Player(p) => {
                self.pos = read_map_pos(r)?;
                p.dir = r.read_unit_vec(8)?;
            }
            ObjectData::Obstacle(o) => {
                self.pos = read_map_pos(r)?;
                o.ori = r.read_bits(ORI_BITS)? as u8;
                o.scale = r.read_float(0.125, 2.5, 8)?;
            }
            ObjectData::Building(b) => {
                b.ceiling_seen = r.read_bool()?;
                b.occupied = r.read_bool()?;
            }
            ObjectData::Structure(_) | ObjectData::Decal(_) => {}
            ObjectData::Loot(_) | ObjectData::DeadBody(_) => {
                self.pos = read_map_pos(r)?;
            }
            ObjectData::Projectile(p) => {
                self.pos = read_map_pos(r)?;
                p.pos_z = r.read_float(0.0, 32.0, 10)?;
                p.dir = r.read_unit_vec(7)?;
            }
            ObjectData::Smoke(sm) => {
                self.pos = read_map_pos(r)?;
                sm.radius = r.read_float(0.0, 16.0, 8)?;
            }
            ObjectData::Airdrop(a) => {
                a.fall_t = r.read_float(0.0, 1.0, 7)?;
                a.landed = r.read_bool()?;
            }
        }
        Ok(())
    }

    pub fn deserialize_full(&mut self, r: &mut BitReader<'_>) -> Result<(), ProtocolError> {
        match &mut self.data {
            ObjectData::Player(p) => {
                self.layer = r.read_bits(LAYER_BITS)? as u8;
                p.dead = r.read_bool()?;
                p.team_id = r.read_u8()?;
            }
            ObjectData::Obstacle(o) => {
                o.health_t = r.read_float(0.0, 1.0, 8)?;
                o.obstacle_type = r.read_u16()?;
                self.layer = r.read_bits(LAYER_BITS)? as u8;
                o.dead = r.read_bool()?;
                o.door_open = r.read_bool()?;
            }
            ObjectData::Building(b) => {
                self.pos = read_map_pos(r)?;
                b.ori = r.read_bits(ORI_BITS)? as u8;
                self.layer = r.read_bits(LAYER_BITS)? as u8;
                b.building_type = r.read_u16()?;
            }
            ObjectData::Structure(st) => {
                self.pos = read_map_pos(r)?;
                st.ori = r.read_bits(ORI_BITS)? as u8;
                st.structure_type = r.read_u16()?;
                self.layer = r.read_bits(LAYER_BITS)? as u8;
            }
            ObjectData::Loot(l) => {
                l.loot_type = r.read_u16()?;
                l.count = r.read_u8()?;
                self.layer = r.read_bits(LAYER_BITS)? as u8;
            }
            ObjectData::Decal(d) => {
                self.pos = read_map_pos(r)?;
                d.scale = r.read_float(0.125, 2.5, 8)?;
                d.decal_type = r.read_u16()?;
                d.ori = r.read_bits(ORI_BITS)? as u8;
                self.layer = r.read_bits(LAYER_BITS)? as u8;
            }
            ObjectData::DeadBody(db) => {
                self.layer = r.read_bits(LAYER_BITS)? as u8;
                db.player_id = r.read_u16()?;
            }
            ObjectData::Projectile(p) => {
                p.projectile_type = r.read_u16()?;
                self.layer = r.read_bits(LAYER_BITS)? as u8;
            }
            ObjectData::Smoke(sm) => {
                self.layer = r.read_bits(LAYER_BITS)? as u8;
                sm.interior = r.read_bits(6)? as u8;
            }
            ObjectData::Airdrop(_) => {
                self.pos = read_map_pos(r)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(data: ObjectData) -> GameObject {
        let mut obj = GameObject::new(Vec2::new(100.0, 200.0), 1, Collider::circle(Vec2::ZERO, 1.0), data);
        obj.id = 42;
        obj
    }

    #[test]
    fn kind_tags_are_stable() {
        for kind in [
            ObjectKind::Player,
            ObjectKind::Obstacle,
            ObjectKind::Loot,
            ObjectKind::DeadBody,
            ObjectKind::Building,
            ObjectKind::Structure,
            ObjectKind::Decal,
            ObjectKind::Projectile,
            ObjectKind::Smoke,
            ObjectKind::Airdrop,
        ] {
            assert_eq!(ObjectKind::from_u8(kind as u8), Some(kind));
            assert_eq!(ObjectData::empty(kind).kind(), kind);
        }
        assert_eq!(ObjectKind::from_u8(4), None);
    }

    #[test]
    fn new_object_centers_collider_on_position() {
        let obj = sample(ObjectData::Loot(Loot { loot_type: 3, count: 1 }));
        assert_eq!(obj.collider.center(), Vec2::new(100.0, 200.0));
    }

    #[test]
    fn obstacle_full_record_reads_back() {
        let obj = sample(ObjectData::Obstacle(Obstacle {
            obstacle_type: 77,
            ori: 3,
            scale: 1.0,
            health_t: 1.0,
            dead: false,
            door_open: true,
        }));
        let mut s = BitStream::with_capacity(64, 64);
        obj.serialize_part(&mut s).unwrap();
        obj.serialize_full(&mut s).unwrap();

        let mut mirror = GameObject::placeholder(42, ObjectKind::Obstacle);
        let mut r = BitReader::new(s.as_bytes());
        mirror.deserialize_part(&mut r).unwrap();
        mirror.deserialize_full(&mut r).unwrap();

        assert_eq!(mirror.layer, 1);
        assert!((mirror.pos.x - 100.0).abs() < 0.05);
        match mirror.data {
            ObjectData::Obstacle(o) => {
                assert_eq!(o.obstacle_type, 77);
                assert_eq!(o.ori, 3);
                assert!(o.door_open);
                assert!(!o.dead);
            }
            other => panic!("unexpected data {other:?}"),
        }
    }

    #[test]
    fn part_record_is_smaller_than_full() {
        let mut player = PlayerState::new(None, "x".into(), 2, 0);
        player.dir = Vec2::new(0.0, 1.0);
        let obj = sample(ObjectData::Player(Box::new(player)));

        let mut part = BitStream::with_capacity(32, 32);
        obj.serialize_part(&mut part).unwrap();
        let mut full = BitStream::with_capacity(32, 32);
        obj.serialize_part(&mut full).unwrap();
        obj.serialize_full(&mut full).unwrap();
        assert!(part.bit_index() < full.bit_index());
    }
}
