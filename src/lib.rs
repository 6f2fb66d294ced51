/// Number of obstacle proximity sensors fed to the network.
pub const OBSTACLE_SENSORS: usize = 2;

/// State vector width: x, z, velocity, obstacle distances, track position.
pub const STATE_DIM: usize = 3 + OBSTACLE_SENSORS + 1;

pub type Features = [f32; STATE_DIM];

pub mod agent;
pub mod env;
pub mod error;
pub mod eval;
pub mod metrics;
pub mod trainer;

pub use agent::{
    AgentConfig, BatchTensors, Experience, LearningConfig, LearningConfigUpdate, QAgent, QNet,
    ReplayBuffer, TrainingMetrics,
};
pub use env::{encode, Action, DriveEnv, EnvConfig, Observation, RewardConfig, StepResult};
pub use error::ConfigMismatch;
pub use eval::{run_eval, EvalStats};
pub use metrics::MetricsReporter;
pub use trainer::{StopReason, Trainer, TrainerConfig};
