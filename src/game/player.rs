//! Player avatar state (authoritative)

use uuid::Uuid;

use super::objects::ObjectId;
use super::physics::Vec2;
use super::TickInput;

/// Default zoom radius of a freshly spawned avatar, in world units
pub const DEFAULT_ZOOM: f32 = 28.0;

/// Starting and maximum health
pub const MAX_HEALTH: f32 = 100.0;

/// Gameplay state attached to every player object
#[derive(Debug, Clone)]
pub struct PlayerState {
    /// Connection controlling this avatar, if any
    pub conn_id: Option<Uuid>,
    pub name: String,
    pub team_id: u8,

    // Facing and view
    pub dir: Vec2,
    pub zoom: f32,

    // Combat
    pub health: f32,
    pub dead: bool,
    pub killer_id: Option<ObjectId>,
    pub weapon_cooldown: f32,

    // Input tracking
    pub last_input_seq: u8,
    pub current_input: TickInput,

    // Stats
    pub kills: u32,
    pub damage_dealt: f32,
    pub damage_taken: f32,
    pub shots_fired: u32,
    pub shots_hit: u32,
    pub spawn_tick: u64,
    pub death_tick: Option<u64>,
}

impl PlayerState {
    pub fn new(conn_id: Option<Uuid>, name: String, team_id: u8, spawn_tick: u64) -> Self {
        Self {
            conn_id,
            name,
            team_id,
            spawn_tick,
            ..Self::default()
        }
    }

    pub fn alive(&self) -> bool {
        !self.dead
    }

    /// Apply damage, returns true if this hit killed the player
    pub fn apply_damage(&mut self, damage: f32, source: Option<ObjectId>, tick: u64) -> bool {
        if self.dead {
            return false;
        }
        self.health = (self.health - damage).max(0.0);
        self.damage_taken += damage;
        if self.health <= 0.0 {
            self.dead = true;
            self.killer_id = source;
            self.death_tick = Some(tick);
            return true;
        }
        false
    }
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            conn_id: None,
            name: String::new(),
            team_id: 0,
            dir: Vec2::new(1.0, 0.0),
            zoom: DEFAULT_ZOOM,
            health: MAX_HEALTH,
            dead: false,
            killer_id: None,
            weapon_cooldown: 0.0,
            last_input_seq: 0,
            current_input: TickInput::default(),
            kills: 0,
            damage_dealt: 0.0,
            damage_taken: 0.0,
            shots_fired: 0,
            shots_hit: 0,
            spawn_tick: 0,
            death_tick: None,
        }
    }
}
