//! Match lifecycle and the authoritative tick loop
//!
//! Every tick runs in strict phase order: drain inputs, gameplay update,
//! compose every connection's messages, flush one buffer per connection,
//! then clear dirty state and release identifiers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GameConfig;
use crate::util::time::{tick_delta, tick_duration, Timer};
use crate::ws::protocol::{
    ClientMsg, DisconnectMsg, Emote, GameOverMsg, InputMsg, MapMsg, PlayerStatsWire,
};

use super::combat::{ArenaRules, Gameplay};
use super::objects::ObjectId;
use super::snapshot::MapSnapshot;
use super::visibility::{ComposeContext, Viewer};
use super::world::World;
use super::{InboundMsg, PlayerInput, TickInput};

/// Depth of the inbound queue shared by all connections of a match
const INPUT_QUEUE: usize = 1024;

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Waiting for players
    Waiting,
    /// Countdown before start
    Countdown,
    /// Match in progress
    InProgress,
    /// Match ended
    Ended,
}

/// Player slots of one match, shared by the match task and matchmaking.
///
/// The low bits count reserved slots; the top bit closes the match to new
/// reservations. Reserving and closing are single atomic updates, so a slot
/// handed out before the close is always honoured by the match.
#[derive(Debug)]
pub struct MatchSlots {
    state: AtomicUsize,
    max_players: usize,
}

const SLOTS_CLOSED: usize = 1 << (usize::BITS - 1);

impl MatchSlots {
    pub fn new(max_players: usize) -> Self {
        Self {
            state: AtomicUsize::new(0),
            max_players,
        }
    }

    pub fn count(&self) -> usize {
        self.state.load(Ordering::Acquire) & !SLOTS_CLOSED
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// Open and not full
    pub fn has_room(&self) -> bool {
        let state = self.state.load(Ordering::Acquire);
        state & SLOTS_CLOSED == 0 && state < self.max_players
    }

    /// Claim one slot; released when the reservation is dropped
    pub fn try_reserve(self: &Arc<Self>) -> Option<SlotReservation> {
        let max = self.max_players;
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state & SLOTS_CLOSED == 0 && state < max).then_some(state + 1)
            })
            .ok()
            .map(|_| SlotReservation { slots: self.clone() })
    }

    /// Refuse further reservations; held slots stay valid
    pub fn close(&self) {
        self.state.fetch_or(SLOTS_CLOSED, Ordering::AcqRel);
    }
}

/// One claimed player slot
#[derive(Debug)]
pub struct SlotReservation {
    slots: Arc<MatchSlots>,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.slots.state.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<PlayerInput>,
    slots: Arc<MatchSlots>,
}

impl MatchHandle {
    pub fn player_count(&self) -> usize {
        self.slots.count()
    }

    pub fn max_players(&self) -> usize {
        self.slots.max_players()
    }

    /// Still accepting players: not started and not full
    pub fn is_joinable(&self) -> bool {
        self.slots.has_room()
    }

    pub fn try_reserve(&self) -> Option<SlotReservation> {
        self.slots.try_reserve()
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches.iter().map(|m| m.value().player_count()).sum()
    }

    /// Reserve a slot in the first match that still has one
    pub fn reserve_slot(&self) -> Option<(MatchHandle, SlotReservation)> {
        self.matches.iter().find_map(|entry| {
            let handle = entry.value();
            handle.try_reserve().map(|slot| (handle.clone(), slot))
        })
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A joined connection: its view state and outbound queue
struct Connection {
    viewer: Viewer,
    outbound: mpsc::Sender<Bytes>,
    /// Rank already reported to a dead player
    reported_death: bool,
    _slot: SlotReservation,
}

/// The authoritative game match
pub struct GameMatch {
    id: Uuid,
    config: GameConfig,
    phase: MatchPhase,
    world: World,
    gameplay: Box<dyn Gameplay>,
    map: MapSnapshot,
    connections: HashMap<Uuid, Connection>,
    input_rx: mpsc::Receiver<PlayerInput>,
    slots: Arc<MatchSlots>,
    countdown_remaining: f32,
    /// Avatars whose connection went away; handed to gameplay before the next update
    departed: Vec<ObjectId>,
    /// Placement of every dead player, 1 being the winner
    ranks: HashMap<ObjectId, u8>,
    winner: Option<ObjectId>,
}

impl GameMatch {
    /// Create a new match running the bundled arena rules
    pub fn new(
        id: Uuid,
        seed: u64,
        config: GameConfig,
        map: &MapMsg,
        snapshot: MapSnapshot,
    ) -> (Self, MatchHandle) {
        Self::with_gameplay(id, seed, config, map, snapshot, Box::new(ArenaRules::new()))
    }

    pub fn with_gameplay(
        id: Uuid,
        seed: u64,
        config: GameConfig,
        map: &MapMsg,
        snapshot: MapSnapshot,
        gameplay: Box<dyn Gameplay>,
    ) -> (Self, MatchHandle) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let slots = Arc::new(MatchSlots::new(config.max_players));

        let handle = MatchHandle {
            id,
            input_tx,
            slots: slots.clone(),
        };

        let mut world = World::new(
            map.width as f32,
            map.height as f32,
            config.cell_size,
            config.tick_rate,
            seed,
        );
        match world.populate_from_map(map) {
            Ok(count) => debug!(match_id = %id, count, "Spawned map objects"),
            Err(e) => error!(match_id = %id, error = %e, "Map objects exceed the identifier space"),
        }
        // Map objects are part of the initial snapshot, not of a tick's events
        world.end_tick();

        let game_match = Self {
            id,
            countdown_remaining: config.countdown_secs,
            config,
            phase: MatchPhase::Waiting,
            world,
            gameplay,
            map: snapshot,
            connections: HashMap::new(),
            input_rx,
            slots,
            departed: Vec::new(),
            ranks: HashMap::new(),
            winner: None,
        };

        (game_match, handle)
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Run the authoritative tick loop
    pub async fn run(mut self) {
        info!(match_id = %self.id, tick_rate = self.config.tick_rate, "Match created");

        let mut tick_interval = interval(tick_duration(self.config.tick_rate));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;
            self.tick();

            if self.phase == MatchPhase::Ended {
                info!(match_id = %self.id, winner = ?self.winner, "Match ended");
                break;
            }

            if self.connections.is_empty() && self.phase != MatchPhase::Waiting {
                info!(match_id = %self.id, "All players left, ending match");
                break;
            }
        }

        self.slots.close();
    }

    /// One full tick
    pub fn tick(&mut self) {
        let timer = Timer::new();
        self.process_inputs();
        self.simulate();
        self.broadcast();

        let elapsed = timer.elapsed();
        if elapsed > tick_duration(self.config.tick_rate) {
            debug!(
                match_id = %self.id,
                tick = self.world.tick,
                elapsed_us = elapsed.as_micros() as u64,
                objects = self.world.register.live_count(),
                connections = self.connections.len(),
                "Slow tick"
            );
        }
        self.world.tick += 1;
    }

    /// Drain the inbound queue and hand departures to gameplay
    fn process_inputs(&mut self) {
        while let Ok(input) = self.input_rx.try_recv() {
            match input.msg {
                InboundMsg::Join { name, outbound, slot } => {
                    self.handle_join(input.conn_id, name, outbound, slot)
                }
                InboundMsg::Client(ClientMsg::Input(msg)) => self.handle_input(input.conn_id, &msg),
                InboundMsg::Client(ClientMsg::Spectate(msg)) => {
                    if let Some(conn) = self.connections.get_mut(&input.conn_id) {
                        conn.viewer.request_spectate(msg);
                    }
                }
                InboundMsg::Client(ClientMsg::Emote(msg)) => {
                    let Some(player_id) = self.connections.get(&input.conn_id).map(|c| c.viewer.player_id) else {
                        continue;
                    };
                    let Some(pos) = self.world.register.get(player_id).map(|o| o.pos) else {
                        continue;
                    };
                    if self.world.is_alive_player(player_id) {
                        self.world.events.emotes.push(Emote {
                            player_id,
                            emote_type: msg.emote_type,
                            is_ping: msg.is_ping,
                            pos: if msg.is_ping { msg.pos } else { pos },
                        });
                    }
                }
                InboundMsg::Client(ClientMsg::Join(_)) => {
                    warn!(match_id = %self.id, conn_id = %input.conn_id, "Repeated join ignored");
                }
                InboundMsg::Leave => self.remove_connection(input.conn_id, "left"),
            }
        }

        for player_id in std::mem::take(&mut self.departed) {
            self.gameplay.on_leave(&mut self.world, player_id);
        }
    }

    /// Handle player join request.
    ///
    /// A join holds a slot reserved while the match was open, so it is
    /// honoured even if the countdown ran out while it sat in the queue.
    fn handle_join(&mut self, conn_id: Uuid, name: String, outbound: mpsc::Sender<Bytes>, slot: SlotReservation) {
        if self.connections.contains_key(&conn_id) {
            warn!(match_id = %self.id, conn_id = %conn_id, "Connection already in match");
            return;
        }

        if self.phase == MatchPhase::Ended || self.connections.len() >= self.config.max_players {
            reject(&outbound, "match_full");
            return;
        }

        let player_id = match self.gameplay.on_join(&mut self.world, conn_id, &name) {
            Ok(id) => id,
            Err(e) => {
                error!(match_id = %self.id, conn_id = %conn_id, error = %e, "Cannot spawn player");
                reject(&outbound, "server_full");
                return;
            }
        };

        let viewer = Viewer::new(conn_id, player_id, self.config.outbound_buffer_bytes);
        self.connections.insert(
            conn_id,
            Connection {
                viewer,
                outbound,
                reported_death: false,
                _slot: slot,
            },
        );

        info!(
            match_id = %self.id,
            conn_id = %conn_id,
            player_id,
            player_count = self.connections.len(),
            "Player joined match"
        );

        // Check if we should start countdown
        if self.phase == MatchPhase::Waiting && self.connections.len() >= self.config.min_players {
            self.phase = MatchPhase::Countdown;
            self.countdown_remaining = self.config.countdown_secs;
            info!(match_id = %self.id, seconds = self.config.countdown_secs, "Countdown started");
        }
    }

    /// Latch the newest input; the sequence is echoed back as the ack
    fn handle_input(&mut self, conn_id: Uuid, msg: &InputMsg) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        conn.viewer.ack = msg.seq;
        if let Some(player) = self.world.player_mut(conn.viewer.player_id) {
            if player.alive() {
                player.last_input_seq = msg.seq;
                player.current_input = TickInput {
                    seq: msg.seq,
                    move_dir: msg.move_dir(),
                    aim_dir: msg.to_mouse_dir,
                    shoot: msg.shoot_start || msg.shoot_hold,
                };
            }
        }
    }

    /// Drop a connection; its avatar is handed to gameplay at the next input phase
    fn remove_connection(&mut self, conn_id: Uuid, reason: &str) {
        let Some(mut conn) = self.connections.remove(&conn_id) else {
            return;
        };
        conn.viewer.release_refs(&mut self.world.register);
        self.departed.push(conn.viewer.player_id);

        info!(
            match_id = %self.id,
            conn_id = %conn_id,
            player_id = conn.viewer.player_id,
            reason,
            "Player left match"
        );
    }

    /// Phase transitions, gameplay, then end-of-round latching
    fn simulate(&mut self) {
        match self.phase {
            MatchPhase::Waiting | MatchPhase::InProgress => {}
            MatchPhase::Countdown => {
                self.countdown_remaining -= tick_delta(self.config.tick_rate);
                if self.countdown_remaining <= 0.0 {
                    self.phase = MatchPhase::InProgress;
                    self.slots.close();
                    self.gameplay.on_start(&mut self.world);
                    info!(match_id = %self.id, tick = self.world.tick, "Match started");
                }
            }
            MatchPhase::Ended => return,
        }

        self.gameplay.update(&mut self.world);

        // Everyone who died this tick shares the placement below the survivors
        let alive = self.world.alive_count();
        let placement = (alive + 1).min(u8::MAX as usize) as u8;
        let newly_dead: Vec<ObjectId> = self
            .world
            .events
            .kills
            .iter()
            .map(|k| k.target_id)
            .filter(|id| !self.ranks.contains_key(id))
            .collect();
        for id in newly_dead {
            self.ranks.insert(id, placement);
        }

        if self.phase == MatchPhase::InProgress && alive <= 1 {
            self.winner = self.world.alive_player_ids().first().copied();
            if let Some(winner) = self.winner {
                self.ranks.insert(winner, 1);
            }
            self.phase = MatchPhase::Ended;
        }
    }

    /// Compose and flush one buffer per connection, then end the tick
    fn broadcast(&mut self) {
        // Observed entities settle before spectators are counted
        for conn in self.connections.values_mut() {
            conn.viewer.resolve_observed(&mut self.world);
        }
        let mut spectators: HashMap<ObjectId, u8> = HashMap::new();
        for conn in self.connections.values() {
            let v = &conn.viewer;
            if v.observed_id != v.player_id {
                let count = spectators.entry(v.observed_id).or_default();
                *count = count.saturating_add(1);
            }
        }

        let ctx = ComposeContext {
            map: &self.map,
            started: matches!(self.phase, MatchPhase::InProgress | MatchPhase::Ended),
            alive_count: self.world.alive_count(),
            spectator_counts: &spectators,
        };

        for conn in self.connections.values_mut() {
            // Overflow is logged by the composer; the connection stays
            if conn.viewer.compose(&mut self.world, &ctx).is_err() {
                continue;
            }

            let game_over = self.phase == MatchPhase::Ended;
            let died = !self.world.is_alive_player(conn.viewer.player_id);
            if game_over || (died && !conn.reported_death) {
                conn.reported_death |= died;
                let msg = game_over_msg(&self.world, &self.ranks, self.winner, conn.viewer.player_id, game_over);
                if let Err(e) = conn.viewer.stream.serialize_msg(&msg) {
                    error!(match_id = %self.id, conn_id = %conn.viewer.conn_id, error = %e, "Game over message dropped");
                }
            }
        }

        let mut dropped = Vec::new();
        for (conn_id, conn) in &mut self.connections {
            let bytes = conn.viewer.stream.take();
            if bytes.is_empty() {
                continue;
            }
            match conn.outbound.try_send(bytes) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(match_id = %self.id, conn_id = %conn_id, "Outbound queue full, dropping slow connection");
                    dropped.push((*conn_id, "slow"));
                }
                Err(TrySendError::Closed(_)) => dropped.push((*conn_id, "closed")),
            }
        }
        for (conn_id, reason) in dropped {
            self.remove_connection(conn_id, reason);
        }

        let released = self.world.end_tick();
        if !released.is_empty() {
            debug!(match_id = %self.id, tick = self.world.tick, count = released.len(), "Identifiers released");
        }
    }
}

/// Standings of one player
fn game_over_msg(
    world: &World,
    ranks: &HashMap<ObjectId, u8>,
    winner: Option<ObjectId>,
    player_id: ObjectId,
    game_over: bool,
) -> GameOverMsg {
    let alive = world.alive_count();
    let team_rank = ranks
        .get(&player_id)
        .copied()
        .unwrap_or_else(|| alive.clamp(1, u8::MAX as usize) as u8);

    let stats = match world.player(player_id) {
        Some(p) => {
            let end_tick = p.death_tick.unwrap_or(world.tick);
            let secs = end_tick.saturating_sub(p.spawn_tick) / world.tick_rate.max(1) as u64;
            PlayerStatsWire {
                player_id,
                kills: p.kills.min(u8::MAX as u32) as u8,
                damage_dealt: p.damage_dealt.clamp(0.0, u16::MAX as f32) as u16,
                damage_taken: p.damage_taken.clamp(0.0, u16::MAX as f32) as u16,
                time_alive: secs.min(u16::MAX as u64) as u16,
            }
        }
        None => PlayerStatsWire {
            player_id,
            kills: 0,
            damage_dealt: 0,
            damage_taken: 0,
            time_alive: 0,
        },
    };

    GameOverMsg {
        team_rank,
        game_over,
        winning_player_id: winner.unwrap_or(0),
        stats,
    }
}

/// Best-effort rejection frame for a connection that never joined
fn reject(outbound: &mpsc::Sender<Bytes>, reason: &str) {
    let msg = DisconnectMsg {
        reason: reason.to_string(),
    };
    match msg.to_frame() {
        Ok(frame) => {
            let _ = outbound.try_send(frame);
        }
        Err(e) => error!(error = %e, "Failed to encode disconnect"),
    }
}
