//! Shrinking safe zone ("gas")
//!
//! Inactive until the match starts, then alternates between waiting (next
//! circle announced) and moving (circle interpolates toward it) for every
//! configured phase.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::ws::protocol::GasData;

use super::physics::{PhysicsSystem, Vec2};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GasMode {
    Inactive = 0,
    Waiting = 1,
    Moving = 2,
}

#[derive(Debug, Clone)]
pub struct GasPhase {
    /// Radius at the end of this phase
    pub target_radius: f32,
    /// Seconds the next circle is shown before it starts moving
    pub wait_duration: f32,
    /// Seconds to shrink to the target
    pub move_duration: f32,
    /// Damage per second outside the circle
    pub damage_per_second: f32,
}

#[derive(Debug, Clone)]
pub struct GasConfig {
    pub initial_radius: f32,
    pub phases: Vec<GasPhase>,
}

impl GasConfig {
    /// Phases scaled to a square map of the given side length
    pub fn for_map(size: f32) -> Self {
        let r = size * 0.75;
        let phase = |frac: f32, wait: f32, mv: f32, dps: f32| GasPhase {
            target_radius: r * frac,
            wait_duration: wait,
            move_duration: mv,
            damage_per_second: dps,
        };
        Self {
            initial_radius: r,
            phases: vec![
                phase(0.6, 80.0, 45.0, 1.5),
                phase(0.35, 60.0, 35.0, 3.0),
                phase(0.18, 45.0, 25.0, 6.0),
                phase(0.07, 30.0, 20.0, 10.0),
                phase(0.0, 20.0, 15.0, 15.0),
            ],
        }
    }
}

pub struct Gas {
    config: GasConfig,
    pub mode: GasMode,
    stage: usize,
    timer: f32,
    duration: f32,
    pos_old: Vec2,
    pos_new: Vec2,
    rad_old: f32,
    rad_new: f32,
    pub current_pos: Vec2,
    pub current_rad: f32,
    /// Mode or geometry changed this tick
    pub dirty: bool,
    /// Interpolation progress changed this tick
    pub circle_dirty: bool,
}

impl Gas {
    pub fn new(config: GasConfig, center: Vec2) -> Self {
        let radius = config.initial_radius;
        Self {
            config,
            mode: GasMode::Inactive,
            stage: 0,
            timer: 0.0,
            duration: 0.0,
            pos_old: center,
            pos_new: center,
            rad_old: radius,
            rad_new: radius,
            current_pos: center,
            current_rad: radius,
            dirty: false,
            circle_dirty: false,
        }
    }

    /// Begin the first phase
    pub fn activate(&mut self, rng: &mut ChaCha8Rng) {
        if self.mode != GasMode::Inactive || self.stage >= self.config.phases.len() {
            return;
        }
        self.begin_waiting(rng);
    }

    fn begin_waiting(&mut self, rng: &mut ChaCha8Rng) {
        let phase = &self.config.phases[self.stage];

        // Next center stays inside the current circle
        let max_offset = (self.rad_old - phase.target_radius).max(0.0) * 0.5;
        let offset = if max_offset > 0.0 {
            rng.gen_range(0.0..max_offset)
        } else {
            0.0
        };
        let angle = rng.gen_range(0.0..std::f32::consts::TAU);

        self.pos_new = self.pos_old + Vec2::new(angle.cos(), angle.sin()) * offset;
        self.rad_new = phase.target_radius;
        self.timer = phase.wait_duration;
        self.duration = phase.wait_duration;
        self.mode = GasMode::Waiting;
        self.dirty = true;
    }

    pub fn advance(&mut self, dt: f32, rng: &mut ChaCha8Rng) {
        match self.mode {
            GasMode::Inactive => {}
            GasMode::Waiting => {
                self.timer -= dt;
                if self.timer <= 0.0 {
                    let phase = &self.config.phases[self.stage];
                    self.timer = phase.move_duration;
                    self.duration = phase.move_duration;
                    self.mode = GasMode::Moving;
                    self.dirty = true;
                }
            }
            GasMode::Moving => {
                self.timer -= dt;
                let t = self.gas_t();
                self.current_pos = self.pos_old + (self.pos_new - self.pos_old) * t;
                self.current_rad = self.rad_old + (self.rad_new - self.rad_old) * t;
                self.circle_dirty = true;

                if self.timer <= 0.0 {
                    self.pos_old = self.pos_new;
                    self.rad_old = self.rad_new;
                    self.current_pos = self.pos_new;
                    self.current_rad = self.rad_new;
                    self.stage += 1;
                    if self.stage < self.config.phases.len() {
                        self.begin_waiting(rng);
                    } else {
                        self.mode = GasMode::Inactive;
                        self.dirty = true;
                    }
                }
            }
        }
    }

    /// Interpolation progress of the current move, 0 when not moving
    pub fn gas_t(&self) -> f32 {
        if self.mode != GasMode::Moving || self.duration <= 0.0 {
            return 0.0;
        }
        1.0 - (self.timer / self.duration).clamp(0.0, 1.0)
    }

    pub fn damage_per_second(&self) -> f32 {
        if self.mode == GasMode::Inactive && self.stage == 0 {
            return 0.0;
        }
        let idx = self.stage.min(self.config.phases.len().saturating_sub(1));
        self.config
            .phases
            .get(idx)
            .map(|p| p.damage_per_second)
            .unwrap_or(0.0)
    }

    pub fn is_outside(&self, pos: Vec2) -> bool {
        !PhysicsSystem::is_in_zone(pos, self.current_pos, self.current_rad)
    }

    pub fn data(&self) -> GasData {
        GasData {
            mode: self.mode as u8,
            duration: self.duration.clamp(0.0, 255.0),
            pos_old: self.pos_old,
            pos_new: self.pos_new,
            rad_old: self.rad_old,
            rad_new: self.rad_new,
        }
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
        self.circle_dirty = false;
    }
}
