//! Visibility composer
//!
//! Each connection keeps the set of object ids it currently holds. Every tick
//! the composer culls the world around the observed entity, diffs the result
//! against that set and writes one update message:
//!
//! - ids that left the view become removals
//! - newly visible or full-dirty objects are sent as full records
//! - visible part-dirty objects are sent as partial patches
//!
//! Every list is capped at 255 entries. Object entries over the cap are
//! deferred to the next tick rather than dropped; transient events are
//! truncated. View references on the register keep an id reserved while any
//! viewer still holds it.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::ws::protocol::{
    ActivePlayerData, AliveCountsMsg, JoinedMsg, KillLeader, MapIndicator, MsgStream, PlayerInfo,
    ProtocolError, SpectateMsg, UpdateMsg, MAX_LIST_LEN, PROTOCOL_VERSION,
};

use super::objects::{GameObject, ObjectId};
use super::physics::{Aabb, Vec2};
use super::player::DEFAULT_ZOOM;
use super::register::ObjectRegister;
use super::snapshot::MapSnapshot;
use super::world::World;

/// Extra world units culled around the zoom radius
pub const VIEW_MARGIN: f32 = 4.0;

/// Longest killer chain followed when the observed player dies
pub const MAX_SPECTATE_DEPTH: usize = 8;

/// Initial size of a connection's outbound buffer
const INITIAL_BUFFER_BYTES: usize = 1024;

/// Length-prefixed lists of the update message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    NewPlayers,
    DeletedPlayers,
    FullObjects,
    PartialObjects,
    DeletedObjects,
    Emotes,
    Bullets,
    Explosions,
    Planes,
    AirstrikeZones,
    MapIndicators,
}

/// What one compose pass emitted for a viewer
#[derive(Debug, Default)]
pub struct ComposeReport {
    pub full: Vec<ObjectId>,
    pub partial: Vec<ObjectId>,
    pub deleted: Vec<ObjectId>,
    /// Categories over the cap, with their untruncated length
    pub truncated: Vec<(Category, usize)>,
    pub bytes: usize,
}

impl ComposeReport {
    pub fn was_truncated(&self, category: Category) -> bool {
        self.truncated.iter().any(|(c, _)| *c == category)
    }
}

/// Match-wide inputs shared by every viewer within one tick
pub struct ComposeContext<'a> {
    pub map: &'a MapSnapshot,
    pub started: bool,
    /// Living players after this tick's updates
    pub alive_count: usize,
    /// Number of viewers observing each player
    pub spectator_counts: &'a HashMap<ObjectId, u8>,
}

/// Truncate `items` to the list cap, returning the overflow
fn split_cap<T>(
    items: &mut Vec<T>,
    category: Category,
    conn_id: Uuid,
    report: &mut ComposeReport,
) -> Vec<T> {
    if items.len() <= MAX_LIST_LEN {
        return Vec::new();
    }
    warn!(
        conn_id = %conn_id,
        category = ?category,
        count = items.len(),
        limit = MAX_LIST_LEN,
        "Update category over limit, truncating"
    );
    report.truncated.push((category, items.len()));
    items.split_off(MAX_LIST_LEN)
}

/// Per-connection view state
pub struct Viewer {
    pub conn_id: Uuid,
    /// The connection's own avatar
    pub player_id: ObjectId,
    /// Self, or the player being spectated
    pub observed_id: ObjectId,
    /// Last input sequence applied, echoed in every update
    pub ack: u8,
    pub stream: MsgStream,
    visible: HashSet<ObjectId>,
    pending_full: HashSet<ObjectId>,
    pending_part: HashSet<ObjectId>,
    seen_indicators: HashMap<u8, u32>,
    sent_observed: Option<ObjectId>,
    sent_alive_count: Option<usize>,
    joined: bool,
    last_spectate_tick: Option<u64>,
    spectate_request: Option<SpectateMsg>,
}

impl Viewer {
    pub fn new(conn_id: Uuid, player_id: ObjectId, buffer_capacity: usize) -> Self {
        Self {
            conn_id,
            player_id,
            observed_id: player_id,
            ack: 0,
            stream: MsgStream::new(INITIAL_BUFFER_BYTES.min(buffer_capacity), buffer_capacity),
            visible: HashSet::new(),
            pending_full: HashSet::new(),
            pending_part: HashSet::new(),
            seen_indicators: HashMap::new(),
            sent_observed: None,
            sent_alive_count: None,
            joined: false,
            last_spectate_tick: None,
            spectate_request: None,
        }
    }

    pub fn visible(&self) -> &HashSet<ObjectId> {
        &self.visible
    }

    pub fn has_joined(&self) -> bool {
        self.joined
    }

    /// Queue a spectate request, applied on the next compose
    pub fn request_spectate(&mut self, msg: SpectateMsg) {
        self.spectate_request = Some(msg);
    }

    /// Drop every view reference this viewer holds (on disconnect)
    pub fn release_refs(&mut self, register: &mut ObjectRegister) {
        for id in self.visible.drain() {
            register.drop_view_ref(id);
        }
        self.pending_full.clear();
        self.pending_part.clear();
    }

    /// Pick the observed entity for this tick; changes at most once per tick
    pub fn resolve_observed(&mut self, world: &mut World) {
        if self.last_spectate_tick == Some(world.tick) {
            return;
        }

        if world.is_alive_player(self.player_id) {
            if self.observed_id != self.player_id {
                self.observed_id = self.player_id;
                self.last_spectate_tick = Some(world.tick);
            }
            self.spectate_request = None;
            return;
        }

        let observed_alive =
            self.observed_id != self.player_id && world.is_alive_player(self.observed_id);
        let next = match self.spectate_request.take() {
            Some(req) if req.spec_next || req.spec_prev => self.cycle_target(world, req.spec_next),
            Some(_) => self.fallback_target(world),
            None if observed_alive => return,
            None => self.fallback_target(world),
        };

        if next != self.observed_id {
            debug!(
                conn_id = %self.conn_id,
                from = self.observed_id,
                to = next,
                "Spectate target changed"
            );
            self.observed_id = next;
        }
        self.last_spectate_tick = Some(world.tick);
    }

    fn fallback_target(&self, world: &mut World) -> ObjectId {
        if let Some(killer) = self.follow_killer(world) {
            return killer;
        }
        let candidates: Vec<ObjectId> = world
            .alive_player_ids()
            .into_iter()
            .filter(|&id| id != self.player_id)
            .collect();
        candidates
            .choose(&mut world.rng)
            .copied()
            .unwrap_or(self.player_id)
    }

    /// Walk killer links from the observed player to the first living killer
    fn follow_killer(&self, world: &World) -> Option<ObjectId> {
        let mut current = self.observed_id;
        for _ in 0..MAX_SPECTATE_DEPTH {
            let killer = world.player(current)?.killer_id?;
            if killer != self.player_id && world.is_alive_player(killer) {
                return Some(killer);
            }
            current = killer;
        }
        None
    }

    fn cycle_target(&self, world: &World, forward: bool) -> ObjectId {
        let candidates: Vec<ObjectId> = world
            .alive_player_ids()
            .into_iter()
            .filter(|&id| id != self.player_id)
            .collect();
        let (Some(&first), Some(&last)) = (candidates.first(), candidates.last()) else {
            return self.player_id;
        };
        let cur = self.observed_id;
        if forward {
            candidates.iter().copied().find(|&id| id > cur).unwrap_or(first)
        } else {
            candidates.iter().rev().copied().find(|&id| id < cur).unwrap_or(last)
        }
    }

    /// Culling rectangle around the observed entity
    pub fn culling_rect(&self, world: &World) -> Option<Aabb> {
        let observed = world
            .register
            .get(self.observed_id)
            .or_else(|| world.register.get(self.player_id))?;
        let zoom = observed.player().map(|p| p.zoom).unwrap_or(DEFAULT_ZOOM);
        Some(Aabb::around(observed.pos, zoom + VIEW_MARGIN))
    }

    fn collect_visible(&self, world: &World) -> HashSet<ObjectId> {
        let mut out = HashSet::new();
        if let Some(rect) = self.culling_rect(world) {
            world.grid.intersect_rect_into(&rect, &mut out);
            out.retain(|&id| {
                world
                    .register
                    .get(id)
                    .is_some_and(|o| o.collider.aabb().overlaps(&rect))
            });
        }
        for id in [self.player_id, self.observed_id] {
            if world.register.contains(id) {
                out.insert(id);
            }
        }
        out
    }

    /// Compose this tick's messages into the viewer's stream.
    ///
    /// On buffer overflow nothing is written and the visible set is kept, so
    /// the next tick resends everything this one could not.
    pub fn compose(
        &mut self,
        world: &mut World,
        ctx: &ComposeContext<'_>,
    ) -> Result<ComposeReport, ProtocolError> {
        self.resolve_observed(world);

        let mut report = ComposeReport::default();
        let now_visible = self.collect_visible(world);
        let register = &world.register;

        let mut removed: Vec<ObjectId> = self.visible.difference(&now_visible).copied().collect();
        removed.sort_unstable();

        let mut full: Vec<ObjectId> = now_visible
            .iter()
            .copied()
            .filter(|&id| {
                !self.visible.contains(&id)
                    || register.is_full_dirty(id)
                    || self.pending_full.contains(&id)
            })
            .collect();
        full.sort_unstable();
        let full_set: HashSet<ObjectId> = full.iter().copied().collect();

        let mut partial: Vec<ObjectId> = now_visible
            .iter()
            .copied()
            .filter(|id| self.visible.contains(id) && !full_set.contains(id))
            .filter(|id| register.is_part_dirty(*id) || self.pending_part.contains(id))
            .collect();
        partial.sort_unstable();

        let deferred_removed = split_cap(&mut removed, Category::DeletedObjects, self.conn_id, &mut report);
        let deferred_full = split_cap(&mut full, Category::FullObjects, self.conn_id, &mut report);
        let deferred_partial = split_cap(&mut partial, Category::PartialObjects, self.conn_id, &mut report);

        // Deferred new objects stay "new"; deferred removals stay held
        let mut committed = now_visible;
        let mut next_pending_full = HashSet::new();
        for id in &deferred_full {
            if self.visible.contains(id) {
                next_pending_full.insert(*id);
            } else {
                committed.remove(id);
            }
        }
        committed.extend(deferred_removed.iter().copied());
        let next_pending_part: HashSet<ObjectId> = deferred_partial.into_iter().collect();

        let mark = self.stream.mark();
        let indicators = self.indicator_changes(world, &mut report);
        let written = self.write_messages(world, ctx, &removed, &full, &partial, &indicators, &committed, &mut report);

        if let Err(e) = written {
            self.stream.rollback(mark);
            error!(
                conn_id = %self.conn_id,
                error = %e,
                full = full.len(),
                partial = partial.len(),
                deleted = removed.len(),
                capacity = self.stream.capacity(),
                "Update does not fit the outbound buffer, message dropped"
            );
            for id in full.iter().chain(&deferred_full) {
                if self.visible.contains(id) {
                    self.pending_full.insert(*id);
                }
            }
            self.pending_part.extend(partial.iter().copied());
            self.pending_part.extend(next_pending_part);
            return Err(e);
        }

        for id in committed.difference(&self.visible) {
            world.register.add_view_ref(*id);
        }
        for id in self.visible.difference(&committed) {
            world.register.drop_view_ref(*id);
        }

        self.visible = committed;
        self.pending_full = next_pending_full;
        self.pending_part = next_pending_part;
        for (indicator, version) in indicators {
            if indicator.dead {
                self.seen_indicators.remove(&indicator.id);
            } else {
                self.seen_indicators.insert(indicator.id, version);
            }
        }
        self.sent_observed = Some(self.observed_id);
        self.sent_alive_count = Some(ctx.alive_count);
        self.joined = true;

        report.full = full;
        report.partial = partial;
        report.deleted = removed;
        report.bytes = self.stream.len();
        Ok(report)
    }

    /// New or changed indicators, plus "dead" records for removed ones
    fn indicator_changes(&self, world: &World, report: &mut ComposeReport) -> Vec<(MapIndicator, u32)> {
        let mut out: Vec<(MapIndicator, u32)> = world
            .indicators
            .iter()
            .filter(|(ind, version)| self.seen_indicators.get(&ind.id) != Some(version))
            .map(|(ind, version)| (*ind, version))
            .collect();
        let mut gone: Vec<u8> = self
            .seen_indicators
            .keys()
            .copied()
            .filter(|id| world.indicators.get(*id).is_none())
            .collect();
        gone.sort_unstable();
        out.extend(gone.into_iter().map(|id| {
            let ind = MapIndicator {
                id,
                dead: true,
                equipped: false,
                indicator_type: 0,
                pos: Vec2::ZERO,
            };
            (ind, 0)
        }));
        // Whatever does not fit is retried next tick since it stays unseen
        split_cap(&mut out, Category::MapIndicators, self.conn_id, report);
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn write_messages(
        &mut self,
        world: &World,
        ctx: &ComposeContext<'_>,
        removed: &[ObjectId],
        full: &[ObjectId],
        partial: &[ObjectId],
        indicators: &[(MapIndicator, u32)],
        visible: &HashSet<ObjectId>,
        report: &mut ComposeReport,
    ) -> Result<(), ProtocolError> {
        let first = !self.joined;
        if first {
            self.stream.serialize_msg(&JoinedMsg {
                protocol_version: PROTOCOL_VERSION,
                player_id: self.player_id,
                team_mode: 1,
                started: ctx.started,
            })?;
            self.stream.splice(ctx.map.as_bytes())?;
        }

        let rect = self.culling_rect(world);
        let in_view = |pos: Vec2| rect.is_some_and(|r| r.contains(pos));
        let events = &world.events;

        let mut player_infos: Vec<PlayerInfo> = if first {
            world.all_player_infos()
        } else {
            events.new_players.clone()
        };
        split_cap(&mut player_infos, Category::NewPlayers, self.conn_id, report);

        let mut deleted_player_ids = events.deleted_player_ids.clone();
        split_cap(&mut deleted_player_ids, Category::DeletedPlayers, self.conn_id, report);

        let mut bullets: Vec<_> = events
            .bullets
            .iter()
            .filter(|b| in_view(b.pos) || in_view(b.pos + b.dir * b.distance))
            .copied()
            .collect();
        split_cap(&mut bullets, Category::Bullets, self.conn_id, report);

        let mut explosions: Vec<_> = events.explosions.iter().filter(|e| in_view(e.pos)).copied().collect();
        split_cap(&mut explosions, Category::Explosions, self.conn_id, report);

        let mut emotes: Vec<_> = events
            .emotes
            .iter()
            .filter(|e| e.is_ping || visible.contains(&e.player_id))
            .copied()
            .collect();
        split_cap(&mut emotes, Category::Emotes, self.conn_id, report);

        let mut planes = events.planes.clone();
        split_cap(&mut planes, Category::Planes, self.conn_id, report);

        let mut airstrike_zones = events.airstrike_zones.clone();
        split_cap(&mut airstrike_zones, Category::AirstrikeZones, self.conn_id, report);

        let observed_changed = self.sent_observed != Some(self.observed_id);
        let active_player = world.player(self.observed_id).map(|p| ActivePlayerData {
            health: p.health,
            zoom: p.zoom.clamp(0.0, 255.0) as u8,
            spectator_count: ctx.spectator_counts.get(&self.observed_id).copied().unwrap_or(0),
            dead: p.dead,
        });

        let kill_leader = if first || events.kill_leader_changed {
            // id 0 clears the leader on the client
            Some(world.kill_leader.unwrap_or(KillLeader { id: 0, kills: 0 }))
        } else {
            None
        };

        let update = UpdateMsg {
            deleted_objects: removed.to_vec(),
            full_objects: full.iter().filter_map(|&id| world.register.get(id)).collect::<Vec<&GameObject>>(),
            partial_objects: partial.iter().filter_map(|&id| world.register.get(id)).collect(),
            active_player_id: (first || observed_changed).then_some(self.observed_id),
            active_player,
            gas: (first || world.gas.dirty).then(|| world.gas.data()),
            gas_t: (first || world.gas.circle_dirty).then(|| world.gas.gas_t()),
            player_infos,
            deleted_player_ids,
            bullets,
            explosions,
            emotes,
            planes,
            airstrike_zones,
            map_indicators: indicators.iter().map(|(ind, _)| *ind).collect(),
            kill_leader,
            ack: self.ack,
        };
        self.stream.serialize_msg(&update)?;

        for kill in &events.kills {
            if let Err(e) = self.stream.serialize_msg(kill) {
                error!(conn_id = %self.conn_id, error = %e, "Kill feed dropped");
                break;
            }
        }
        if self.sent_alive_count != Some(ctx.alive_count) {
            self.stream.serialize_msg(&AliveCountsMsg {
                counts: vec![ctx.alive_count.min(u8::MAX as usize) as u8],
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::objects::{Loot, ObjectData, ObjectKind};
    use crate::game::physics::Collider;
    use crate::game::player::PlayerState;
    use crate::game::snapshot::default_map;
    use crate::ws::bitstream::BitReader;
    use crate::ws::protocol::{read_msg_type, Bullet, MapMsg, MsgType};

    struct Fixture {
        world: World,
        map: MapSnapshot,
        spectators: HashMap<ObjectId, u8>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                world: World::new(1024.0, 1024.0, 16.0, 30, 7),
                map: MapSnapshot::render(&default_map(1024, 1024, 7)).unwrap(),
                spectators: HashMap::new(),
            }
        }

        fn player(&mut self, x: f32, y: f32, zoom: f32) -> ObjectId {
            let mut state = PlayerState::new(None, "p".into(), 1, 0);
            state.zoom = zoom;
            self.world
                .register_new(GameObject::new(
                    Vec2::new(x, y),
                    0,
                    Collider::circle(Vec2::ZERO, 1.0),
                    ObjectData::Player(Box::new(state)),
                ))
                .unwrap()
        }

        fn loot(&mut self, x: f32, y: f32) -> ObjectId {
            self.world
                .register_new(GameObject::new(
                    Vec2::new(x, y),
                    0,
                    Collider::circle(Vec2::ZERO, 0.5),
                    ObjectData::Loot(Loot { loot_type: 2, count: 1 }),
                ))
                .unwrap()
        }

        fn try_compose(&mut self, viewer: &mut Viewer) -> Result<ComposeReport, ProtocolError> {
            let ctx = ComposeContext {
                map: &self.map,
                started: true,
                alive_count: self.world.alive_count(),
                spectator_counts: &self.spectators,
            };
            viewer.compose(&mut self.world, &ctx)
        }

        fn compose(&mut self, viewer: &mut Viewer) -> ComposeReport {
            self.try_compose(viewer).unwrap()
        }

        fn end_tick(&mut self) {
            self.world.end_tick();
            self.world.tick += 1;
        }
    }

    /// Decode the update message of a buffer, skipping the handshake if present
    fn decode_update(bytes: &[u8]) -> UpdateMsg<GameObject> {
        let mut r = BitReader::new(bytes);
        loop {
            match read_msg_type(&mut r).unwrap() {
                MsgType::Joined => {
                    JoinedMsg::deserialize(&mut r).unwrap();
                }
                MsgType::Map => {
                    MapMsg::deserialize(&mut r).unwrap();
                }
                MsgType::Update => {
                    let msg = UpdateMsg::<GameObject>::deserialize(&mut r, |_| Some(ObjectKind::Loot)).unwrap();
                    r.align_to_byte().unwrap();
                    return msg;
                }
                other => panic!("unexpected {other:?}"),
            }
            r.align_to_byte().unwrap();
        }
    }

    /// Alive count carried by a buffer, if any
    fn alive_count_in(bytes: &[u8]) -> Option<u8> {
        let mut r = BitReader::new(bytes);
        let mut count = None;
        while r.remaining_bits() >= 8 {
            match read_msg_type(&mut r).unwrap() {
                MsgType::Joined => {
                    JoinedMsg::deserialize(&mut r).unwrap();
                }
                MsgType::Map => {
                    MapMsg::deserialize(&mut r).unwrap();
                }
                MsgType::Update => {
                    UpdateMsg::<GameObject>::deserialize(&mut r, |_| Some(ObjectKind::Player)).unwrap();
                }
                MsgType::AliveCounts => {
                    count = AliveCountsMsg::deserialize(&mut r).unwrap().counts.first().copied();
                }
                other => panic!("unexpected {other:?}"),
            }
            r.align_to_byte().unwrap();
        }
        count
    }

    #[test]
    fn first_appearance_is_full_and_removal_is_sent_once() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        let item = fx.loot(110.0, 100.0);
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);

        let report = fx.compose(&mut viewer);
        assert_eq!(report.full, vec![me, item]);
        assert!(report.partial.is_empty());
        fx.end_tick();

        // Unchanged: nothing to send
        let report = fx.compose(&mut viewer);
        assert!(report.full.is_empty() && report.partial.is_empty() && report.deleted.is_empty());
        fx.end_tick();

        fx.world.move_object(item, Vec2::new(500.0, 500.0)).unwrap();
        let report = fx.compose(&mut viewer);
        assert_eq!(report.deleted, vec![item]);
        fx.end_tick();

        let report = fx.compose(&mut viewer);
        assert!(report.deleted.is_empty());
        assert!(!viewer.visible().contains(&item));
    }

    #[test]
    fn full_dirty_wins_over_part_dirty() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        let item = fx.loot(105.0, 100.0);
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);
        fx.compose(&mut viewer);
        fx.end_tick();

        fx.world.move_object(item, Vec2::new(106.0, 100.0)).unwrap();
        fx.world.register.mark_full_dirty(item);
        let report = fx.compose(&mut viewer);
        assert_eq!(report.full, vec![item]);
        assert!(report.partial.is_empty());
        fx.end_tick();

        fx.world.move_object(item, Vec2::new(107.0, 100.0)).unwrap();
        let report = fx.compose(&mut viewer);
        assert_eq!(report.partial, vec![item]);
        assert!(report.full.is_empty());
    }

    #[test]
    fn own_avatar_is_always_visible() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 0.0);
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);
        let report = fx.compose(&mut viewer);
        assert_eq!(report.full, vec![me]);
        assert!(viewer.visible().contains(&me));
    }

    #[test]
    fn ids_stay_reserved_until_every_viewer_dropped_them() {
        let mut fx = Fixture::new();
        let ids: Vec<ObjectId> = (0..3).map(|i| fx.player(100.0 + i as f32, 100.0, 16.0)).collect();
        let item = fx.loot(102.0, 102.0);
        let mut viewers: Vec<Viewer> = ids.iter().map(|&id| Viewer::new(Uuid::new_v4(), id, 65536)).collect();
        for v in &mut viewers {
            fx.compose(v);
        }
        assert_eq!(fx.world.register.view_refs(item), 3);
        fx.end_tick();

        fx.world.destroy(item).unwrap();
        // Only two viewers get a pass this tick
        fx.compose(&mut viewers[0]);
        fx.compose(&mut viewers[1]);
        assert_eq!(fx.world.register.view_refs(item), 1);
        fx.end_tick();
        fx.end_tick();
        assert!(fx.world.register.pending_release().contains(&item));
        let spawned = fx.loot(900.0, 900.0);
        assert_ne!(spawned, item);

        let report = fx.compose(&mut viewers[2]);
        assert_eq!(report.deleted, vec![item]);
        fx.end_tick();
        assert!(!fx.world.register.pending_release().contains(&item));
        assert_eq!(fx.loot(900.0, 900.0), item);
    }

    #[test]
    fn disconnect_releases_held_ids() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        let item = fx.loot(101.0, 101.0);
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);
        fx.compose(&mut viewer);
        assert_eq!(fx.world.register.view_refs(item), 1);

        viewer.release_refs(&mut fx.world.register);
        assert_eq!(fx.world.register.view_refs(item), 0);
        assert_eq!(fx.world.register.view_refs(me), 0);
        assert!(viewer.visible().is_empty());
    }

    #[test]
    fn bullets_over_the_cap_are_truncated_to_255() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        for _ in 0..300 {
            fx.world.events.bullets.push(Bullet {
                player_id: me,
                pos: Vec2::new(100.0, 100.0),
                dir: Vec2::new(1.0, 0.0),
                bullet_type: 1,
                layer: 0,
                distance: 10.0,
                has_special_fx: false,
            });
        }
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);
        let report = fx.compose(&mut viewer);
        assert!(report.was_truncated(Category::Bullets));
        assert!(report.truncated.contains(&(Category::Bullets, 300)));

        let bytes = viewer.stream.take();
        let update = decode_update(&bytes);
        assert_eq!(update.bullets.len(), 255);
        assert_eq!(update.full_objects.len(), 1);
    }

    #[test]
    fn full_objects_over_the_cap_are_deferred() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 30.0);
        for i in 0..300 {
            fx.loot(80.0 + (i % 20) as f32 * 2.0, 80.0 + (i / 20) as f32 * 2.0);
        }
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);

        let first = fx.compose(&mut viewer);
        assert_eq!(first.full.len(), 255);
        assert!(first.was_truncated(Category::FullObjects));
        assert_eq!(viewer.visible().len(), 255);
        fx.end_tick();

        let second = fx.compose(&mut viewer);
        assert_eq!(second.full.len(), 301 - 255);
        assert_eq!(viewer.visible().len(), 301);
        let overlap: HashSet<_> = first.full.iter().collect();
        assert!(second.full.iter().all(|id| !overlap.contains(id)));
    }

    #[test]
    fn overflowing_buffer_drops_the_whole_update() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        for i in 0..40 {
            fx.loot(90.0 + i as f32 * 0.5, 100.0);
        }
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 96);
        let err = fx.try_compose(&mut viewer).unwrap_err();
        assert_eq!(err, ProtocolError::Overflow { capacity: 96 });
        assert!(viewer.stream.is_empty());
        assert!(viewer.visible().is_empty());
        assert!(!viewer.has_joined());
        assert_eq!(fx.world.register.view_refs(me), 0);
    }

    #[test]
    fn alive_count_is_resent_after_a_dropped_update() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        let other = fx.player(600.0, 600.0, 16.0);
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 1024);
        fx.compose(&mut viewer);
        assert_eq!(alive_count_in(&viewer.stream.take()), Some(2));
        fx.end_tick();

        // The count changes in a tick whose update cannot fit
        fx.world.player_mut(other).unwrap().apply_damage(500.0, None, 1);
        for _ in 0..MAX_LIST_LEN {
            fx.world.events.bullets.push(Bullet {
                player_id: me,
                pos: Vec2::new(100.0, 100.0),
                dir: Vec2::new(1.0, 0.0),
                bullet_type: 1,
                layer: 0,
                distance: 10.0,
                has_special_fx: false,
            });
        }
        assert!(fx.try_compose(&mut viewer).is_err());
        assert!(viewer.stream.is_empty());
        fx.end_tick();

        fx.compose(&mut viewer);
        assert_eq!(alive_count_in(&viewer.stream.take()), Some(1));
        fx.end_tick();

        fx.compose(&mut viewer);
        assert_eq!(alive_count_in(&viewer.stream.take()), None);
    }

    #[test]
    fn dead_viewer_spectates_the_killer() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        let killer = fx.player(600.0, 600.0, 16.0);
        let other = fx.player(300.0, 300.0, 16.0);
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);
        fx.compose(&mut viewer);
        fx.end_tick();

        fx.world.player_mut(me).unwrap().apply_damage(500.0, Some(killer), 1);
        let report = fx.compose(&mut viewer);
        assert_eq!(viewer.observed_id, killer);
        assert!(report.full.contains(&killer));
        assert!(report.deleted.is_empty(), "own avatar stays held");
        fx.end_tick();

        // Killer dies to `other`: follow the chain
        fx.world.player_mut(killer).unwrap().apply_damage(500.0, Some(other), 2);
        fx.compose(&mut viewer);
        assert_eq!(viewer.observed_id, other);
    }

    #[test]
    fn spectate_falls_back_to_a_random_living_player_then_self() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        let other = fx.player(300.0, 300.0, 16.0);
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);
        fx.world.player_mut(me).unwrap().apply_damage(500.0, None, 0);
        fx.compose(&mut viewer);
        assert_eq!(viewer.observed_id, other);
        fx.end_tick();

        fx.world.player_mut(other).unwrap().apply_damage(500.0, None, 1);
        fx.compose(&mut viewer);
        assert_eq!(viewer.observed_id, me);
    }

    #[test]
    fn spectate_changes_at_most_once_per_tick() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        let a = fx.player(200.0, 200.0, 16.0);
        let b = fx.player(300.0, 300.0, 16.0);
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);
        fx.world.player_mut(me).unwrap().apply_damage(500.0, Some(a), 0);
        viewer.resolve_observed(&mut fx.world);
        assert_eq!(viewer.observed_id, a);

        viewer.request_spectate(SpectateMsg {
            spec_next: true,
            ..Default::default()
        });
        viewer.resolve_observed(&mut fx.world);
        assert_eq!(viewer.observed_id, a);

        fx.world.tick += 1;
        viewer.resolve_observed(&mut fx.world);
        assert_eq!(viewer.observed_id, b);
    }

    #[test]
    fn map_indicators_are_sent_on_change_and_removal() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);
        let marker = MapIndicator {
            id: 3,
            dead: false,
            equipped: false,
            indicator_type: 1,
            pos: Vec2::new(500.0, 500.0),
        };
        fx.world.indicators.set(marker);
        fx.compose(&mut viewer);
        let update = decode_update(&viewer.stream.take());
        assert_eq!(update.map_indicators.len(), 1);
        fx.end_tick();

        fx.compose(&mut viewer);
        assert!(decode_update(&viewer.stream.take()).map_indicators.is_empty());
        fx.end_tick();

        fx.world.indicators.remove(3);
        fx.compose(&mut viewer);
        let update = decode_update(&viewer.stream.take());
        assert_eq!(update.map_indicators.len(), 1);
        assert!(update.map_indicators[0].dead);
    }

    #[test]
    fn first_buffer_carries_handshake_and_map() {
        let mut fx = Fixture::new();
        let me = fx.player(100.0, 100.0, 16.0);
        let mut viewer = Viewer::new(Uuid::new_v4(), me, 65536);
        fx.compose(&mut viewer);
        let bytes = viewer.stream.take();

        let mut r = BitReader::new(&bytes);
        assert_eq!(read_msg_type(&mut r).unwrap(), MsgType::Joined);
        let joined = JoinedMsg::deserialize(&mut r).unwrap();
        assert_eq!(joined.player_id, me);
        assert_eq!(joined.protocol_version, PROTOCOL_VERSION);
        r.align_to_byte().unwrap();
        assert_eq!(read_msg_type(&mut r).unwrap(), MsgType::Map);
        fx.end_tick();

        fx.compose(&mut viewer);
        let bytes = viewer.stream.take();
        assert_eq!(bytes[0], MsgType::Update as u8);
    }
}
