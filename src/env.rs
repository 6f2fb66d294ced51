use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::{Features, OBSTACLE_SENSORS, STATE_DIM};

// =============================================================================
// Reward Tuning Knobs
// =============================================================================

pub struct RewardConfig {
    /// Per-tick reward proportional to forward speed.
    pub velocity_scale: f32,
    pub collision_penalty: f32,
    pub checkpoint_bonus: f32,
    pub off_track_penalty: f32,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            velocity_scale: 1.0,
            collision_penalty: 10.0,
            checkpoint_bonus: 5.0,
            off_track_penalty: 20.0,
        }
    }
}

// =============================================================================
// Environment Constants
// =============================================================================

pub struct EnvConfig {
    pub track_half_width: f32,
    pub lap_length: f32,
    pub obstacle_count: usize,
    pub max_speed: f32,
    pub acceleration: f32,
    pub brake_deceleration: f32,
    pub turn_rate: f32,
    pub collision_radius: f32,
    pub checkpoint_interval: f32,
    pub max_episode_ticks: u32,
    /// Distances beyond this are reported as exactly this value.
    pub sensor_range: f32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            track_half_width: 10.0,
            lap_length: 100.0,
            obstacle_count: 12,
            max_speed: 3.0,
            acceleration: 0.01,
            brake_deceleration: 0.1,
            turn_rate: 0.025,
            collision_radius: 1.5,
            checkpoint_interval: 25.0,
            max_episode_ticks: 1_000,
            sensor_range: 20.0,
        }
    }
}

// =============================================================================
// Action Space
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    Accelerate = 0,
    Brake = 1,
    SteerLeft = 2,
    SteerRight = 3,
}

impl Action {
    pub const COUNT: usize = 4;

    pub fn from_index(i: usize) -> Self {
        assert!(i < Self::COUNT);
        // SAFETY: repr(u8) and we checked bounds
        unsafe { std::mem::transmute(i as u8) }
    }
}

// =============================================================================
// Observation & State Encoding
// =============================================================================

/// One tick's worth of raw environment readings. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub position: (f32, f32),
    pub velocity: f32,
    pub obstacle_distances: [f32; OBSTACLE_SENSORS],
    pub track_position: f32,
}

/// Flattens an observation into the fixed-order feature vector the network
/// consumes: x, z, velocity, obstacle distances, track position. Pure and
/// deterministic; the output length is `STATE_DIM` by construction.
pub fn encode(obs: &Observation) -> Features {
    let mut f = [0.0f32; STATE_DIM];
    f[0] = obs.position.0;
    f[1] = obs.position.1;
    f[2] = obs.velocity;
    f[3..3 + OBSTACLE_SENSORS].copy_from_slice(&obs.obstacle_distances);
    f[3 + OBSTACLE_SENSORS] = obs.track_position;
    f
}

// =============================================================================
// Driving Environment
// =============================================================================

pub struct StepResult {
    pub observation: Observation,
    pub reward: f32,
    pub collided: bool,
    pub checkpoint: bool,
    pub done: bool,
}

/// A straight looping track with seeded, procedurally scattered obstacles.
/// The car moves along its heading each tick; leaving the track ends the
/// episode with a penalty, passing a checkpoint gate earns a bonus, and
/// brushing an obstacle costs points but does not end the episode.
pub struct DriveEnv {
    config: EnvConfig,
    reward: RewardConfig,
    rng: SmallRng,
    obstacles: Vec<(f32, f32)>,
    x: f32,
    z: f32,
    heading: f32,
    speed: f32,
    tick: u32,
}

impl DriveEnv {
    pub fn new(config: EnvConfig, reward: RewardConfig, seed: u64) -> Self {
        let mut env = Self {
            config,
            reward,
            rng: SmallRng::seed_from_u64(seed),
            obstacles: Vec::new(),
            x: 0.0,
            z: 0.0,
            heading: 0.0,
            speed: 0.0,
            tick: 0,
        };
        env.scatter_obstacles();
        env
    }

    fn scatter_obstacles(&mut self) {
        let half = self.config.track_half_width;
        let lap = self.config.lap_length;
        // Keep the spawn point clear so episodes never start in contact.
        let z_min = self.config.collision_radius * 2.0;
        self.obstacles.clear();
        for _ in 0..self.config.obstacle_count {
            let x = self.rng.random_range(-half..half);
            let z = self.rng.random_range(z_min..lap);
            self.obstacles.push((x, z));
        }
    }

    /// Reseats the car at the start line and re-scatters obstacles.
    pub fn reset(&mut self) -> Observation {
        self.x = 0.0;
        self.z = 0.0;
        self.heading = 0.0;
        self.speed = 0.0;
        self.tick = 0;
        self.scatter_obstacles();
        self.observe()
    }

    pub fn observe(&self) -> Observation {
        Observation {
            position: (self.x, self.z),
            velocity: self.speed,
            obstacle_distances: self.sensor_distances(),
            track_position: self.z,
        }
    }

    pub fn obstacles(&self) -> &[(f32, f32)] {
        &self.obstacles
    }

    fn sensor_distances(&self) -> [f32; OBSTACLE_SENSORS] {
        let range = self.config.sensor_range;
        let mut dists: Vec<f32> = self
            .obstacles
            .iter()
            .map(|&(ox, oz)| {
                let (dx, dz) = (ox - self.x, oz - self.z);
                (dx * dx + dz * dz).sqrt().min(range)
            })
            .collect();
        dists.sort_by(f32::total_cmp);
        let mut nearest = [range; OBSTACLE_SENSORS];
        for (slot, d) in nearest.iter_mut().zip(dists) {
            *slot = d;
        }
        nearest
    }

    fn apply_action(&mut self, action: Action) {
        let c = &self.config;
        match action {
            Action::Accelerate => self.speed = (self.speed + c.acceleration).min(c.max_speed),
            Action::Brake => self.speed = (self.speed - c.brake_deceleration).max(0.0),
            Action::SteerLeft => self.heading += c.turn_rate,
            Action::SteerRight => self.heading -= c.turn_rate,
        }
    }

    /// Applies one action and advances the simulation a single tick.
    pub fn step(&mut self, action: Action) -> StepResult {
        self.apply_action(action);

        let prev_gate = (self.z / self.config.checkpoint_interval).floor();
        self.x += self.heading.sin() * self.speed;
        self.z += self.heading.cos() * self.speed;
        self.tick += 1;

        let mut reward = self.speed * self.reward.velocity_scale;

        let checkpoint = (self.z / self.config.checkpoint_interval).floor() > prev_gate;
        if checkpoint {
            reward += self.reward.checkpoint_bonus;
        }
        if self.z >= self.config.lap_length {
            self.z -= self.config.lap_length;
        }

        let collided = self.obstacles.iter().any(|&(ox, oz)| {
            let (dx, dz) = (ox - self.x, oz - self.z);
            (dx * dx + dz * dz).sqrt() < self.config.collision_radius
        });
        if collided {
            reward -= self.reward.collision_penalty;
        }

        let off_track = self.x.abs() > self.config.track_half_width;
        if off_track {
            reward -= self.reward.off_track_penalty;
        }
        let done = off_track || self.tick >= self.config.max_episode_ticks;

        StepResult {
            observation: self.observe(),
            reward,
            collided,
            checkpoint,
            done,
        }
    }
}
