//! Binary wire protocol
//!
//! Every message is a one-byte type tag followed by its fields, then padded to
//! the next byte boundary. The encoding is not self-describing: readers must
//! know the field layout, so any layout change bumps [`PROTOCOL_VERSION`].

use std::borrow::Borrow;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::game::objects::{GameObject, ObjectId, ObjectKind};
use crate::game::physics::Vec2;

use super::bitstream::{BitReader, BitStream};

/// Version exchanged in the join handshake; clients must match exactly
pub const PROTOCOL_VERSION: u32 = 12;

/// Upper bound of world coordinates on the wire
pub const WORLD_EXTENT: f32 = 1024.0;
const POS_BITS: u32 = 16;

/// Longest list any per-tick category may carry (8-bit length prefix)
pub const MAX_LIST_LEN: usize = u8::MAX as usize;

pub const NAME_LEN: usize = 16;
pub const MAP_NAME_LEN: usize = 24;
pub const REASON_LEN: usize = 32;

/// Wire errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("stream capacity of {capacity} bytes exceeded")]
    Overflow { capacity: usize },

    #[error("message truncated, {needed} more bits required")]
    Truncated { needed: usize },

    #[error("unknown message type {0}")]
    UnknownMsgType(u8),

    #[error("unexpected message type {0:?}")]
    UnexpectedMsgType(MsgType),

    #[error("protocol version mismatch: server {server}, client {client}")]
    VersionMismatch { server: u32, client: u32 },

    #[error("invalid {0} on the wire")]
    InvalidField(&'static str),

    #[error("list of {len} entries exceeds the 8-bit length prefix")]
    ListTooLong { len: usize },

    #[error("{0} unread bytes after message")]
    TrailingBytes(usize),
}

/// Stable per-message-type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Join = 1,
    Disconnect = 2,
    Input = 3,
    Joined = 5,
    Update = 6,
    Kill = 7,
    GameOver = 8,
    Map = 10,
    Spectate = 11,
    Emote = 13,
    AliveCounts = 20,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => MsgType::Join,
            2 => MsgType::Disconnect,
            3 => MsgType::Input,
            5 => MsgType::Joined,
            6 => MsgType::Update,
            7 => MsgType::Kill,
            8 => MsgType::GameOver,
            10 => MsgType::Map,
            11 => MsgType::Spectate,
            13 => MsgType::Emote,
            20 => MsgType::AliveCounts,
            other => return Err(ProtocolError::UnknownMsgType(other)),
        })
    }
}

/// World position quantised over `[0, WORLD_EXTENT]`; maps larger than the
/// extent are refused at startup
pub fn write_map_pos(s: &mut BitStream, pos: Vec2) -> Result<(), ProtocolError> {
    s.write_vec(pos, Vec2::ZERO, Vec2::new(WORLD_EXTENT, WORLD_EXTENT), POS_BITS)
}

pub fn read_map_pos(r: &mut BitReader<'_>) -> Result<Vec2, ProtocolError> {
    r.read_vec(Vec2::ZERO, Vec2::new(WORLD_EXTENT, WORLD_EXTENT), POS_BITS)
}

fn write_len(s: &mut BitStream, len: usize) -> Result<(), ProtocolError> {
    if len > MAX_LIST_LEN {
        return Err(ProtocolError::ListTooLong { len });
    }
    s.write_u8(len as u8)
}

fn write_list<T>(
    s: &mut BitStream,
    items: &[T],
    mut write: impl FnMut(&mut BitStream, &T) -> Result<(), ProtocolError>,
) -> Result<(), ProtocolError> {
    write_len(s, items.len())?;
    for item in items {
        write(s, item)?;
    }
    Ok(())
}

fn read_list<T>(
    r: &mut BitReader<'_>,
    mut read: impl FnMut(&mut BitReader<'_>) -> Result<T, ProtocolError>,
) -> Result<Vec<T>, ProtocolError> {
    let len = r.read_u8()? as usize;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(read(r)?);
    }
    Ok(out)
}

/// Field-level writer of a message body
pub trait WireMessage {
    const TYPE: MsgType;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError>;
}

/// Write `msg` as a complete tagged, byte-aligned message
pub fn serialize<M: WireMessage>(s: &mut BitStream, msg: &M) -> Result<(), ProtocolError> {
    s.write_u8(M::TYPE as u8)?;
    msg.serialize(s)?;
    s.align_to_byte()
}

/// Read the tag of the next message
pub fn read_msg_type(r: &mut BitReader<'_>) -> Result<MsgType, ProtocolError> {
    MsgType::from_u8(r.read_u8()?)
}

// ============================================================================
// Client -> server
// ============================================================================

/// First message of every connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinMsg {
    pub protocol: u32,
    pub name: String,
}

impl WireMessage for JoinMsg {
    const TYPE: MsgType = MsgType::Join;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        s.write_u32(self.protocol)?;
        s.write_string(&self.name, NAME_LEN)
    }
}

impl JoinMsg {
    pub fn deserialize(r: &mut BitReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            protocol: r.read_u32()?,
            name: r.read_string(NAME_LEN)?,
        })
    }

    /// Reject clients built against another wire layout
    pub fn check_version(&self) -> Result<(), ProtocolError> {
        if self.protocol != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                server: PROTOCOL_VERSION,
                client: self.protocol,
            });
        }
        Ok(())
    }
}

/// Per-tick player input
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputMsg {
    pub seq: u8,
    pub move_left: bool,
    pub move_right: bool,
    pub move_up: bool,
    pub move_down: bool,
    pub shoot_start: bool,
    pub shoot_hold: bool,
    pub to_mouse_dir: Vec2,
}

impl InputMsg {
    /// Movement direction implied by the held keys (not normalized)
    pub fn move_dir(&self) -> Vec2 {
        let x = self.move_right as i8 - self.move_left as i8;
        let y = self.move_up as i8 - self.move_down as i8;
        Vec2::new(x as f32, y as f32)
    }

    pub fn deserialize(r: &mut BitReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            seq: r.read_u8()?,
            move_left: r.read_bool()?,
            move_right: r.read_bool()?,
            move_up: r.read_bool()?,
            move_down: r.read_bool()?,
            shoot_start: r.read_bool()?,
            shoot_hold: r.read_bool()?,
            to_mouse_dir: r.read_unit_vec(10)?,
        })
    }
}

impl WireMessage for InputMsg {
    const TYPE: MsgType = MsgType::Input;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        s.write_u8(self.seq)?;
        s.write_bool(self.move_left)?;
        s.write_bool(self.move_right)?;
        s.write_bool(self.move_up)?;
        s.write_bool(self.move_down)?;
        s.write_bool(self.shoot_start)?;
        s.write_bool(self.shoot_hold)?;
        s.write_unit_vec(self.to_mouse_dir, 10)
    }
}

/// Spectator camera controls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpectateMsg {
    pub spec_begin: bool,
    pub spec_next: bool,
    pub spec_prev: bool,
    pub spec_force: bool,
}

impl SpectateMsg {
    pub fn deserialize(r: &mut BitReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            spec_begin: r.read_bool()?,
            spec_next: r.read_bool()?,
            spec_prev: r.read_bool()?,
            spec_force: r.read_bool()?,
        })
    }
}

impl WireMessage for SpectateMsg {
    const TYPE: MsgType = MsgType::Spectate;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        s.write_bool(self.spec_begin)?;
        s.write_bool(self.spec_next)?;
        s.write_bool(self.spec_prev)?;
        s.write_bool(self.spec_force)
    }
}

/// Emote or map ping request
#[derive(Debug, Clone, PartialEq)]
pub struct EmoteMsg {
    pub pos: Vec2,
    pub emote_type: u16,
    pub is_ping: bool,
}

impl EmoteMsg {
    pub fn deserialize(r: &mut BitReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            pos: read_map_pos(r)?,
            emote_type: r.read_u16()?,
            is_ping: r.read_bool()?,
        })
    }
}

impl WireMessage for EmoteMsg {
    const TYPE: MsgType = MsgType::Emote;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        write_map_pos(s, self.pos)?;
        s.write_u16(self.emote_type)?;
        s.write_bool(self.is_ping)
    }
}

/// Messages accepted from clients
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    Join(JoinMsg),
    Input(InputMsg),
    Spectate(SpectateMsg),
    Emote(EmoteMsg),
}

impl ClientMsg {
    /// Decode one binary frame holding exactly one message
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = BitReader::new(frame);
        let msg = match read_msg_type(&mut r)? {
            MsgType::Join => ClientMsg::Join(JoinMsg::deserialize(&mut r)?),
            MsgType::Input => ClientMsg::Input(InputMsg::deserialize(&mut r)?),
            MsgType::Spectate => ClientMsg::Spectate(SpectateMsg::deserialize(&mut r)?),
            MsgType::Emote => ClientMsg::Emote(EmoteMsg::deserialize(&mut r)?),
            other => return Err(ProtocolError::UnexpectedMsgType(other)),
        };
        r.align_to_byte()?;
        if !r.is_at_end() {
            return Err(ProtocolError::TrailingBytes(r.remaining_bits() / 8));
        }
        Ok(msg)
    }
}

// ============================================================================
// Server -> client
// ============================================================================

/// Handshake reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedMsg {
    pub protocol_version: u32,
    pub player_id: ObjectId,
    pub team_mode: u8,
    pub started: bool,
}

impl JoinedMsg {
    pub fn deserialize(r: &mut BitReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            protocol_version: r.read_u32()?,
            player_id: r.read_u16()?,
            team_mode: r.read_u8()?,
            started: r.read_bool()?,
        })
    }
}

impl WireMessage for JoinedMsg {
    const TYPE: MsgType = MsgType::Joined;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        s.write_u32(self.protocol_version)?;
        s.write_u16(self.player_id)?;
        s.write_u8(self.team_mode)?;
        s.write_bool(self.started)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPlace {
    pub name: String,
    pub pos: Vec2,
}

/// Static map prop, identical for every viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapObject {
    pub pos: Vec2,
    #[serde(default = "default_scale")]
    pub scale: f32,
    pub object_type: u16,
    #[serde(default)]
    pub ori: u8,
}

fn default_scale() -> f32 {
    1.0
}

/// Connection-independent map payload, produced by the external map generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMsg {
    pub map_name: String,
    pub seed: u32,
    pub width: u16,
    pub height: u16,
    #[serde(default)]
    pub shore_inset: u16,
    #[serde(default)]
    pub grass_inset: u16,
    #[serde(default)]
    pub places: Vec<MapPlace>,
    #[serde(default)]
    pub objects: Vec<MapObject>,
}

impl MapMsg {
    pub fn deserialize(r: &mut BitReader<'_>) -> Result<Self, ProtocolError> {
        let map_name = r.read_string(MAP_NAME_LEN)?;
        let seed = r.read_u32()?;
        let width = r.read_u16()?;
        let height = r.read_u16()?;
        let shore_inset = r.read_u16()?;
        let grass_inset = r.read_u16()?;
        let places = read_list(r, |r| {
            Ok(MapPlace {
                name: r.read_string(NAME_LEN)?,
                pos: read_map_pos(r)?,
            })
        })?;
        let count = r.read_u16()? as usize;
        let mut objects = Vec::with_capacity(count);
        for _ in 0..count {
            objects.push(MapObject {
                pos: read_map_pos(r)?,
                scale: r.read_float(0.125, 2.5, 8)?,
                object_type: r.read_u16()?,
                ori: r.read_bits(2)? as u8,
            });
        }
        Ok(Self {
            map_name,
            seed,
            width,
            height,
            shore_inset,
            grass_inset,
            places,
            objects,
        })
    }
}

impl WireMessage for MapMsg {
    const TYPE: MsgType = MsgType::Map;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        s.write_string(&self.map_name, MAP_NAME_LEN)?;
        s.write_u32(self.seed)?;
        s.write_u16(self.width)?;
        s.write_u16(self.height)?;
        s.write_u16(self.shore_inset)?;
        s.write_u16(self.grass_inset)?;
        write_list(s, &self.places, |s, place| {
            s.write_string(&place.name, NAME_LEN)?;
            write_map_pos(s, place.pos)
        })?;
        if self.objects.len() > u16::MAX as usize {
            return Err(ProtocolError::ListTooLong {
                len: self.objects.len(),
            });
        }
        s.write_u16(self.objects.len() as u16)?;
        for obj in &self.objects {
            write_map_pos(s, obj.pos)?;
            s.write_float(obj.scale, 0.125, 2.5, 8)?;
            s.write_u16(obj.object_type)?;
            s.write_bits(obj.ori as u32, 2)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub player_id: ObjectId,
    pub team_id: u8,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivePlayerData {
    pub health: f32,
    pub zoom: u8,
    pub spectator_count: u8,
    pub dead: bool,
}

/// Shrinking safe zone geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasData {
    pub mode: u8,
    pub duration: f32,
    pub pos_old: Vec2,
    pub pos_new: Vec2,
    pub rad_old: f32,
    pub rad_new: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bullet {
    pub player_id: ObjectId,
    pub pos: Vec2,
    pub dir: Vec2,
    pub bullet_type: u16,
    pub layer: u8,
    pub distance: f32,
    pub has_special_fx: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Explosion {
    pub pos: Vec2,
    pub explosion_type: u16,
    pub layer: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Emote {
    pub player_id: ObjectId,
    pub emote_type: u16,
    pub is_ping: bool,
    pub pos: Vec2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub id: u8,
    pub pos: Vec2,
    pub dir: Vec2,
    pub action_complete: bool,
    pub action: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirstrikeZone {
    pub pos: Vec2,
    pub radius: f32,
    pub duration: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapIndicator {
    pub id: u8,
    pub dead: bool,
    pub equipped: bool,
    pub indicator_type: u16,
    pub pos: Vec2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillLeader {
    pub id: ObjectId,
    pub kills: u8,
}

/// Bit flags of the sections present in an [`UpdateMsg`]
pub mod update_flags {
    pub const DELETED_OBJECTS: u16 = 1 << 0;
    pub const FULL_OBJECTS: u16 = 1 << 1;
    pub const PARTIAL_OBJECTS: u16 = 1 << 2;
    pub const ACTIVE_PLAYER_ID: u16 = 1 << 3;
    pub const ACTIVE_PLAYER_DATA: u16 = 1 << 4;
    pub const GAS: u16 = 1 << 5;
    pub const GAS_CIRCLE: u16 = 1 << 6;
    pub const PLAYER_INFOS: u16 = 1 << 7;
    pub const DELETED_PLAYER_IDS: u16 = 1 << 8;
    pub const BULLETS: u16 = 1 << 9;
    pub const EXPLOSIONS: u16 = 1 << 10;
    pub const EMOTES: u16 = 1 << 11;
    pub const PLANES: u16 = 1 << 12;
    pub const AIRSTRIKE_ZONES: u16 = 1 << 13;
    pub const MAP_INDICATORS: u16 = 1 << 14;
    pub const KILL_LEADER: u16 = 1 << 15;
}

/// Per-viewer, per-tick world delta.
///
/// `O` is `&GameObject` when composing on the server and `GameObject` when
/// decoding on the client side.
#[derive(Debug, Clone)]
pub struct UpdateMsg<O> {
    pub deleted_objects: Vec<ObjectId>,
    pub full_objects: Vec<O>,
    pub partial_objects: Vec<O>,
    pub active_player_id: Option<ObjectId>,
    pub active_player: Option<ActivePlayerData>,
    pub gas: Option<GasData>,
    pub gas_t: Option<f32>,
    pub player_infos: Vec<PlayerInfo>,
    pub deleted_player_ids: Vec<ObjectId>,
    pub bullets: Vec<Bullet>,
    pub explosions: Vec<Explosion>,
    pub emotes: Vec<Emote>,
    pub planes: Vec<Plane>,
    pub airstrike_zones: Vec<AirstrikeZone>,
    pub map_indicators: Vec<MapIndicator>,
    pub kill_leader: Option<KillLeader>,
    pub ack: u8,
}

impl<O> Default for UpdateMsg<O> {
    fn default() -> Self {
        Self {
            deleted_objects: Vec::new(),
            full_objects: Vec::new(),
            partial_objects: Vec::new(),
            active_player_id: None,
            active_player: None,
            gas: None,
            gas_t: None,
            player_infos: Vec::new(),
            deleted_player_ids: Vec::new(),
            bullets: Vec::new(),
            explosions: Vec::new(),
            emotes: Vec::new(),
            planes: Vec::new(),
            airstrike_zones: Vec::new(),
            map_indicators: Vec::new(),
            kill_leader: None,
            ack: 0,
        }
    }
}

impl<O> UpdateMsg<O> {
    fn flags(&self) -> u16 {
        use update_flags::*;
        let mut flags = 0;
        let mut set = |present: bool, bit: u16| {
            if present {
                flags |= bit;
            }
        };
        set(!self.deleted_objects.is_empty(), DELETED_OBJECTS);
        set(!self.full_objects.is_empty(), FULL_OBJECTS);
        set(!self.partial_objects.is_empty(), PARTIAL_OBJECTS);
        set(self.active_player_id.is_some(), ACTIVE_PLAYER_ID);
        set(self.active_player.is_some(), ACTIVE_PLAYER_DATA);
        set(self.gas.is_some(), GAS);
        set(self.gas_t.is_some(), GAS_CIRCLE);
        set(!self.player_infos.is_empty(), PLAYER_INFOS);
        set(!self.deleted_player_ids.is_empty(), DELETED_PLAYER_IDS);
        set(!self.bullets.is_empty(), BULLETS);
        set(!self.explosions.is_empty(), EXPLOSIONS);
        set(!self.emotes.is_empty(), EMOTES);
        set(!self.planes.is_empty(), PLANES);
        set(!self.airstrike_zones.is_empty(), AIRSTRIKE_ZONES);
        set(!self.map_indicators.is_empty(), MAP_INDICATORS);
        set(self.kill_leader.is_some(), KILL_LEADER);
        flags
    }
}

impl<O: Borrow<GameObject>> WireMessage for UpdateMsg<O> {
    const TYPE: MsgType = MsgType::Update;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        use update_flags::*;
        let flags = self.flags();
        s.write_u16(flags)?;

        if flags & DELETED_OBJECTS != 0 {
            write_list(s, &self.deleted_objects, |s, id| s.write_u16(*id))?;
        }
        if flags & FULL_OBJECTS != 0 {
            write_list(s, &self.full_objects, |s, obj| {
                let obj = obj.borrow();
                s.write_u8(obj.kind() as u8)?;
                s.write_u16(obj.id)?;
                obj.serialize_part(s)?;
                obj.serialize_full(s)
            })?;
        }
        if flags & PARTIAL_OBJECTS != 0 {
            write_list(s, &self.partial_objects, |s, obj| {
                let obj = obj.borrow();
                s.write_u16(obj.id)?;
                obj.serialize_part(s)
            })?;
        }
        if let Some(id) = self.active_player_id {
            s.write_u16(id)?;
        }
        if let Some(data) = &self.active_player {
            s.write_float(data.health, 0.0, 100.0, 8)?;
            s.write_u8(data.zoom)?;
            s.write_u8(data.spectator_count)?;
            s.write_bool(data.dead)?;
        }
        if let Some(gas) = &self.gas {
            s.write_u8(gas.mode)?;
            s.write_float(gas.duration, 0.0, 255.0, 8)?;
            write_map_pos(s, gas.pos_old)?;
            write_map_pos(s, gas.pos_new)?;
            s.write_float(gas.rad_old, 0.0, 2048.0, 16)?;
            s.write_float(gas.rad_new, 0.0, 2048.0, 16)?;
        }
        if let Some(gas_t) = self.gas_t {
            s.write_float(gas_t, 0.0, 1.0, 16)?;
        }
        if flags & PLAYER_INFOS != 0 {
            write_list(s, &self.player_infos, |s, info| {
                s.write_u16(info.player_id)?;
                s.write_u8(info.team_id)?;
                s.write_string(&info.name, NAME_LEN)
            })?;
        }
        if flags & DELETED_PLAYER_IDS != 0 {
            write_list(s, &self.deleted_player_ids, |s, id| s.write_u16(*id))?;
        }
        if flags & BULLETS != 0 {
            write_list(s, &self.bullets, |s, b| {
                s.write_u16(b.player_id)?;
                write_map_pos(s, b.pos)?;
                s.write_unit_vec(b.dir, 8)?;
                s.write_u16(b.bullet_type)?;
                s.write_bits(b.layer as u32, 2)?;
                s.write_float(b.distance, 0.0, 512.0, 10)?;
                s.write_bool(b.has_special_fx)
            })?;
        }
        if flags & EXPLOSIONS != 0 {
            write_list(s, &self.explosions, |s, e| {
                write_map_pos(s, e.pos)?;
                s.write_u16(e.explosion_type)?;
                s.write_bits(e.layer as u32, 2)
            })?;
        }
        if flags & EMOTES != 0 {
            write_list(s, &self.emotes, |s, e| {
                s.write_u16(e.player_id)?;
                s.write_u16(e.emote_type)?;
                s.write_bool(e.is_ping)?;
                if e.is_ping {
                    write_map_pos(s, e.pos)?;
                }
                Ok(())
            })?;
        }
        if flags & PLANES != 0 {
            write_list(s, &self.planes, |s, p| {
                s.write_u8(p.id)?;
                write_map_pos(s, p.pos)?;
                s.write_unit_vec(p.dir, 8)?;
                s.write_bool(p.action_complete)?;
                s.write_bits(p.action as u32, 3)
            })?;
        }
        if flags & AIRSTRIKE_ZONES != 0 {
            write_list(s, &self.airstrike_zones, |s, z| {
                write_map_pos(s, z.pos)?;
                s.write_float(z.radius, 0.0, 256.0, 8)?;
                s.write_float(z.duration, 0.0, 256.0, 8)
            })?;
        }
        if flags & MAP_INDICATORS != 0 {
            write_list(s, &self.map_indicators, |s, m| {
                s.write_u8(m.id)?;
                s.write_bool(m.dead)?;
                s.write_bool(m.equipped)?;
                s.write_u16(m.indicator_type)?;
                write_map_pos(s, m.pos)
            })?;
        }
        if let Some(leader) = &self.kill_leader {
            s.write_u16(leader.id)?;
            s.write_u8(leader.kills)?;
        }
        s.write_u8(self.ack)
    }
}

impl UpdateMsg<GameObject> {
    /// Client-side decode; `kind_of` resolves kinds of objects the client
    /// already holds so their partial records can be parsed
    pub fn deserialize(
        r: &mut BitReader<'_>,
        kind_of: impl Fn(ObjectId) -> Option<ObjectKind>,
    ) -> Result<Self, ProtocolError> {
        use update_flags::*;
        let flags = r.read_u16()?;
        let mut msg = UpdateMsg::<GameObject>::default();

        if flags & DELETED_OBJECTS != 0 {
            msg.deleted_objects = read_list(r, |r| r.read_u16())?;
        }
        if flags & FULL_OBJECTS != 0 {
            msg.full_objects = read_list(r, |r| {
                let kind = ObjectKind::from_u8(r.read_u8()?).ok_or(ProtocolError::InvalidField("object kind"))?;
                let mut obj = GameObject::placeholder(r.read_u16()?, kind);
                obj.deserialize_part(r)?;
                obj.deserialize_full(r)?;
                Ok(obj)
            })?;
        }
        if flags & PARTIAL_OBJECTS != 0 {
            let full = &msg.full_objects;
            msg.partial_objects = read_list(r, |r| {
                let id = r.read_u16()?;
                let kind = full
                    .iter()
                    .find(|o| o.id == id)
                    .map(GameObject::kind)
                    .or_else(|| kind_of(id))
                    .ok_or(ProtocolError::InvalidField("partial object id"))?;
                let mut obj = GameObject::placeholder(id, kind);
                obj.deserialize_part(r)?;
                Ok(obj)
            })?;
        }
        if flags & ACTIVE_PLAYER_ID != 0 {
            msg.active_player_id = Some(r.read_u16()?);
        }
        if flags & ACTIVE_PLAYER_DATA != 0 {
            msg.active_player = Some(ActivePlayerData {
                health: r.read_float(0.0, 100.0, 8)?,
                zoom: r.read_u8()?,
                spectator_count: r.read_u8()?,
                dead: r.read_bool()?,
            });
        }
        if flags & GAS != 0 {
            msg.gas = Some(GasData {
                mode: r.read_u8()?,
                duration: r.read_float(0.0, 255.0, 8)?,
                pos_old: read_map_pos(r)?,
                pos_new: read_map_pos(r)?,
                rad_old: r.read_float(0.0, 2048.0, 16)?,
                rad_new: r.read_float(0.0, 2048.0, 16)?,
            });
        }
        if flags & GAS_CIRCLE != 0 {
            msg.gas_t = Some(r.read_float(0.0, 1.0, 16)?);
        }
        if flags & PLAYER_INFOS != 0 {
            msg.player_infos = read_list(r, |r| {
                Ok(PlayerInfo {
                    player_id: r.read_u16()?,
                    team_id: r.read_u8()?,
                    name: r.read_string(NAME_LEN)?,
                })
            })?;
        }
        if flags & DELETED_PLAYER_IDS != 0 {
            msg.deleted_player_ids = read_list(r, |r| r.read_u16())?;
        }
        if flags & BULLETS != 0 {
            msg.bullets = read_list(r, |r| {
                Ok(Bullet {
                    player_id: r.read_u16()?,
                    pos: read_map_pos(r)?,
                    dir: r.read_unit_vec(8)?,
                    bullet_type: r.read_u16()?,
                    layer: r.read_bits(2)? as u8,
                    distance: r.read_float(0.0, 512.0, 10)?,
                    has_special_fx: r.read_bool()?,
                })
            })?;
        }
        if flags & EXPLOSIONS != 0 {
            msg.explosions = read_list(r, |r| {
                Ok(Explosion {
                    pos: read_map_pos(r)?,
                    explosion_type: r.read_u16()?,
                    layer: r.read_bits(2)? as u8,
                })
            })?;
        }
        if flags & EMOTES != 0 {
            msg.emotes = read_list(r, |r| {
                let player_id = r.read_u16()?;
                let emote_type = r.read_u16()?;
                let is_ping = r.read_bool()?;
                let pos = if is_ping { read_map_pos(r)? } else { Vec2::ZERO };
                Ok(Emote {
                    player_id,
                    emote_type,
                    is_ping,
                    pos,
                })
            })?;
        }
        if flags & PLANES != 0 {
            msg.planes = read_list(r, |r| {
                Ok(Plane {
                    id: r.read_u8()?,
                    pos: read_map_pos(r)?,
                    dir: r.read_unit_vec(8)?,
                    action_complete: r.read_bool()?,
                    action: r.read_bits(3)? as u8,
                })
            })?;
        }
        if flags & AIRSTRIKE_ZONES != 0 {
            msg.airstrike_zones = read_list(r, |r| {
                Ok(AirstrikeZone {
                    pos: read_map_pos(r)?,
                    radius: r.read_float(0.0, 256.0, 8)?,
                    duration: r.read_float(0.0, 256.0, 8)?,
                })
            })?;
        }
        if flags & MAP_INDICATORS != 0 {
            msg.map_indicators = read_list(r, |r| {
                Ok(MapIndicator {
                    id: r.read_u8()?,
                    dead: r.read_bool()?,
                    equipped: r.read_bool()?,
                    indicator_type: r.read_u16()?,
                    pos: read_map_pos(r)?,
                })
            })?;
        }
        if flags & KILL_LEADER != 0 {
            msg.kill_leader = Some(KillLeader {
                id: r.read_u16()?,
                kills: r.read_u8()?,
            });
        }
        msg.ack = r.read_u8()?;
        Ok(msg)
    }
}

/// Kill feed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillMsg {
    pub damage_type: u8,
    pub target_id: ObjectId,
    pub killer_id: ObjectId,
    pub killed: bool,
    pub killer_kills: u8,
}

impl KillMsg {
    pub fn deserialize(r: &mut BitReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            damage_type: r.read_u8()?,
            target_id: r.read_u16()?,
            killer_id: r.read_u16()?,
            killed: r.read_bool()?,
            killer_kills: r.read_u8()?,
        })
    }
}

impl WireMessage for KillMsg {
    const TYPE: MsgType = MsgType::Kill;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        s.write_u8(self.damage_type)?;
        s.write_u16(self.target_id)?;
        s.write_u16(self.killer_id)?;
        s.write_bool(self.killed)?;
        s.write_u8(self.killer_kills)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerStatsWire {
    pub player_id: ObjectId,
    pub kills: u8,
    pub damage_dealt: u16,
    pub damage_taken: u16,
    pub time_alive: u16,
}

/// Final standings for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameOverMsg {
    pub team_rank: u8,
    pub game_over: bool,
    pub winning_player_id: ObjectId,
    pub stats: PlayerStatsWire,
}

impl GameOverMsg {
    pub fn deserialize(r: &mut BitReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            team_rank: r.read_u8()?,
            game_over: r.read_bool()?,
            winning_player_id: r.read_u16()?,
            stats: PlayerStatsWire {
                player_id: r.read_u16()?,
                kills: r.read_u8()?,
                damage_dealt: r.read_u16()?,
                damage_taken: r.read_u16()?,
                time_alive: r.read_u16()?,
            },
        })
    }
}

impl WireMessage for GameOverMsg {
    const TYPE: MsgType = MsgType::GameOver;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        s.write_u8(self.team_rank)?;
        s.write_bool(self.game_over)?;
        s.write_u16(self.winning_player_id)?;
        s.write_u16(self.stats.player_id)?;
        s.write_u8(self.stats.kills)?;
        s.write_u16(self.stats.damage_dealt)?;
        s.write_u16(self.stats.damage_taken)?;
        s.write_u16(self.stats.time_alive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveCountsMsg {
    pub counts: Vec<u8>,
}

impl AliveCountsMsg {
    pub fn deserialize(r: &mut BitReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            counts: read_list(r, |r| r.read_u8())?,
        })
    }
}

impl WireMessage for AliveCountsMsg {
    const TYPE: MsgType = MsgType::AliveCounts;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        write_list(s, &self.counts, |s, c| s.write_u8(*c))
    }
}

/// Server-initiated disconnect with a client-facing reason key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectMsg {
    pub reason: String,
}

impl DisconnectMsg {
    pub fn deserialize(r: &mut BitReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            reason: r.read_string(REASON_LEN)?,
        })
    }

    /// Standalone frame, used outside the tick loop
    pub fn to_frame(&self) -> Result<Bytes, ProtocolError> {
        let mut stream = MsgStream::new(64, 64);
        stream.serialize_msg(self)?;
        Ok(stream.take())
    }
}

impl WireMessage for DisconnectMsg {
    const TYPE: MsgType = MsgType::Disconnect;

    fn serialize(&self, s: &mut BitStream) -> Result<(), ProtocolError> {
        s.write_string(&self.reason, REASON_LEN)
    }
}

/// Ordered sequence of messages bound for one connection
pub struct MsgStream {
    stream: BitStream,
}

impl MsgStream {
    pub fn new(initial: usize, capacity: usize) -> Self {
        Self {
            stream: BitStream::with_capacity(initial, capacity),
        }
    }

    /// Append one message; on failure the partial message is rolled back so
    /// messages already in the stream stay well-framed
    pub fn serialize_msg<M: WireMessage>(&mut self, msg: &M) -> Result<(), ProtocolError> {
        let start = self.stream.bit_index();
        serialize(&mut self.stream, msg).inspect_err(|_| self.stream.truncate_bits(start))
    }

    /// Append a message that was serialized once elsewhere (tag included)
    pub fn splice(&mut self, pre_serialized: &[u8]) -> Result<(), ProtocolError> {
        let start = self.stream.bit_index();
        self.stream
            .write_bytes(pre_serialized)
            .inspect_err(|_| self.stream.truncate_bits(start))
    }

    /// Current end of the stream, for [`MsgStream::rollback`]
    pub fn mark(&self) -> usize {
        self.stream.bit_index()
    }

    /// Drop every message written after `mark`
    pub fn rollback(&mut self, mark: usize) {
        self.stream.truncate_bits(mark);
    }

    pub fn len(&self) -> usize {
        self.stream.byte_len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.stream.capacity()
    }

    /// Hand the buffered bytes off and reset for the next tick
    pub fn take(&mut self) -> Bytes {
        let bytes = Bytes::copy_from_slice(self.stream.as_bytes());
        self.stream.clear();
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::objects::{Loot, ObjectData};
    use crate::game::physics::Collider;
    use tokio_test::{assert_err, assert_ok};

    fn frame<M: WireMessage>(msg: &M) -> Bytes {
        let mut stream = MsgStream::new(64, 1024);
        stream.serialize_msg(msg).unwrap();
        stream.take()
    }

    #[test]
    fn client_messages_decode_by_tag() {
        let join = JoinMsg {
            protocol: PROTOCOL_VERSION,
            name: "sniper".into(),
        };
        assert_eq!(ClientMsg::decode(&frame(&join)).unwrap(), ClientMsg::Join(join));

        let input = InputMsg {
            seq: 9,
            move_right: true,
            shoot_hold: true,
            to_mouse_dir: Vec2::new(1.0, 0.0),
            ..Default::default()
        };
        match ClientMsg::decode(&frame(&input)).unwrap() {
            ClientMsg::Input(decoded) => {
                assert_eq!(decoded.seq, 9);
                assert!(decoded.move_right && decoded.shoot_hold);
                assert_eq!(decoded.move_dir(), Vec2::new(1.0, 0.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_messages_are_rejected_from_clients() {
        let joined = JoinedMsg {
            protocol_version: PROTOCOL_VERSION,
            player_id: 1,
            team_mode: 1,
            started: false,
        };
        assert_eq!(
            ClientMsg::decode(&frame(&joined)).unwrap_err(),
            ProtocolError::UnexpectedMsgType(MsgType::Joined)
        );
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert_eq!(ClientMsg::decode(&[]).unwrap_err(), ProtocolError::Truncated { needed: 8 });
        assert_eq!(ClientMsg::decode(&[200]).unwrap_err(), ProtocolError::UnknownMsgType(200));
        assert_err!(ClientMsg::decode(&[MsgType::Join as u8, 1, 2]));

        let mut bytes = frame(&SpectateMsg::default()).to_vec();
        bytes.push(0);
        assert_eq!(ClientMsg::decode(&bytes).unwrap_err(), ProtocolError::TrailingBytes(1));
    }

    #[test]
    fn version_mismatch_is_detected() {
        let join = JoinMsg {
            protocol: PROTOCOL_VERSION + 1,
            name: String::new(),
        };
        assert_eq!(
            join.check_version().unwrap_err(),
            ProtocolError::VersionMismatch {
                server: PROTOCOL_VERSION,
                client: PROTOCOL_VERSION + 1
            }
        );
    }

    #[test]
    fn oversized_lists_are_refused_not_widened() {
        let msg = AliveCountsMsg { counts: vec![1; 300] };
        let mut stream = MsgStream::new(16, 4096);
        assert_eq!(
            stream.serialize_msg(&msg).unwrap_err(),
            ProtocolError::ListTooLong { len: 300 }
        );
        assert!(stream.is_empty());
    }

    #[test]
    fn failed_message_rolls_back_to_previous_boundary() {
        let mut stream = MsgStream::new(8, 8);
        assert_ok!(stream.serialize_msg(&KillMsg {
            damage_type: 1,
            target_id: 2,
            killer_id: 3,
            killed: true,
            killer_kills: 1,
        }));
        let before = stream.len();
        let err = stream.serialize_msg(&DisconnectMsg {
            reason: "index-server-full".into(),
        });
        assert_eq!(err.unwrap_err(), ProtocolError::Overflow { capacity: 8 });
        assert_eq!(stream.len(), before);

        let bytes = stream.take();
        let mut r = BitReader::new(&bytes);
        assert_eq!(read_msg_type(&mut r).unwrap(), MsgType::Kill);
        assert_eq!(KillMsg::deserialize(&mut r).unwrap().killer_id, 3);
        r.align_to_byte().unwrap();
        assert!(r.is_at_end());
    }

    #[test]
    fn positions_keep_precision_up_to_the_far_edge() {
        let mut s = BitStream::with_capacity(16, 16);
        let far = Vec2::new(1023.9, 1000.25);
        assert_ok!(write_map_pos(&mut s, far));
        let back = assert_ok!(read_map_pos(&mut BitReader::new(s.as_bytes())));
        let step = WORLD_EXTENT / u16::MAX as f32;
        assert!((back.x - far.x).abs() <= step);
        assert!((back.y - far.y).abs() <= step);
    }

    #[test]
    fn spliced_map_is_readable_in_sequence() {
        let map = MapMsg {
            map_name: "main".into(),
            seed: 99,
            width: 512,
            height: 512,
            shore_inset: 16,
            grass_inset: 8,
            places: vec![MapPlace {
                name: "Dock".into(),
                pos: Vec2::new(50.0, 60.0),
            }],
            objects: vec![MapObject {
                pos: Vec2::new(10.0, 10.0),
                scale: 1.0,
                object_type: 4,
                ori: 1,
            }],
        };
        let rendered = frame(&map);

        let mut stream = MsgStream::new(64, 1024);
        stream
            .serialize_msg(&JoinedMsg {
                protocol_version: PROTOCOL_VERSION,
                player_id: 4,
                team_mode: 1,
                started: true,
            })
            .unwrap();
        stream.splice(&rendered).unwrap();
        let bytes = stream.take();

        let mut r = BitReader::new(&bytes);
        assert_eq!(read_msg_type(&mut r).unwrap(), MsgType::Joined);
        assert_eq!(JoinedMsg::deserialize(&mut r).unwrap().player_id, 4);
        r.align_to_byte().unwrap();
        assert_eq!(read_msg_type(&mut r).unwrap(), MsgType::Map);
        let decoded = MapMsg::deserialize(&mut r).unwrap();
        assert_eq!(decoded.map_name, "main");
        assert_eq!(decoded.places[0].name, "Dock");
        assert_eq!(decoded.objects[0].object_type, 4);
        assert_eq!(decoded.objects[0].ori, 1);
    }

    #[test]
    fn update_sections_follow_flags() {
        let mut loot = GameObject::new(
            Vec2::new(300.0, 300.0),
            0,
            Collider::circle(Vec2::ZERO, 1.0),
            ObjectData::Loot(Loot { loot_type: 8, count: 30 }),
        );
        loot.id = 17;

        let msg = UpdateMsg {
            deleted_objects: vec![3, 4],
            full_objects: vec![&loot],
            partial_objects: vec![&loot],
            gas_t: Some(0.5),
            emotes: vec![Emote {
                player_id: 2,
                emote_type: 5,
                is_ping: true,
                pos: Vec2::new(100.0, 100.0),
            }],
            ack: 77,
            ..Default::default()
        };
        let bytes = frame(&msg);

        let mut r = BitReader::new(&bytes);
        assert_eq!(read_msg_type(&mut r).unwrap(), MsgType::Update);
        let decoded = UpdateMsg::<GameObject>::deserialize(&mut r, |_| None).unwrap();
        assert_eq!(decoded.deleted_objects, vec![3, 4]);
        assert_eq!(decoded.full_objects.len(), 1);
        assert_eq!(decoded.full_objects[0].kind(), ObjectKind::Loot);
        assert_eq!(decoded.partial_objects[0].id, 17);
        assert!(decoded.bullets.is_empty());
        assert!((decoded.emotes[0].pos.x - 100.0).abs() < 0.05);
        assert_eq!(decoded.ack, 77);
        r.align_to_byte().unwrap();
        assert!(r.is_at_end());
    }

    #[test]
    fn partial_for_unknown_object_is_an_error() {
        let mut loot = GameObject::new(
            Vec2::new(1.0, 1.0),
            0,
            Collider::circle(Vec2::ZERO, 1.0),
            ObjectData::Loot(Loot::default()),
        );
        loot.id = 5;
        let msg = UpdateMsg {
            partial_objects: vec![&loot],
            ..Default::default()
        };
        let bytes = frame(&msg);
        let mut r = BitReader::new(&bytes[1..]);
        assert_eq!(
            UpdateMsg::<GameObject>::deserialize(&mut r, |_| None).unwrap_err(),
            ProtocolError::InvalidField("partial object id")
        );
    }
}
