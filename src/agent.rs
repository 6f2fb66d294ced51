use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::env::Action;
use crate::error::ConfigMismatch;
use crate::metrics::MetricsReporter;
use crate::{Features, STATE_DIM};

// =============================================================================
// Configuration
// =============================================================================

/// Tunable learning parameters. Exploration decays over training; the other
/// fields change only through `QAgent::update_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub exploration_rate: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            discount_factor: 0.99,
            exploration_rate: 0.1,
        }
    }
}

/// Partial update merged into `LearningConfig`; absent fields are untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct LearningConfigUpdate {
    pub learning_rate: Option<f64>,
    pub discount_factor: Option<f64>,
    pub exploration_rate: Option<f64>,
}

pub struct AgentConfig {
    pub state_dim: usize,
    pub action_count: usize,
    pub hidden1: usize,
    pub hidden2: usize,
    pub replay_capacity: usize,
    pub batch_size: usize,
    pub epsilon_decay: f64,
    pub epsilon_floor: f64,
    /// Fixed seed for reproducible runs; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_dim: STATE_DIM,
            action_count: Action::COUNT,
            hidden1: 64,
            hidden2: 32,
            replay_capacity: 10_000,
            batch_size: 64,
            epsilon_decay: 0.99,
            epsilon_floor: 0.01,
            seed: None,
        }
    }
}

// =============================================================================
// Experience Replay Buffer
// =============================================================================

/// One observed transition. No terminal flag is carried: the bootstrap term
/// is always applied, matching the system this agent drives.
#[derive(Clone, Serialize, Deserialize)]
pub struct Experience {
    pub state: Features,
    pub action: usize,
    pub reward: f32,
    pub next_state: Features,
}

#[derive(Serialize, Deserialize)]
pub struct ReplayBuffer {
    buffer: VecDeque<Experience>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends, evicting the oldest entry once capacity is reached.
    pub fn push(&mut self, e: Experience) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(e);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Experience> {
        self.buffer.iter()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = std::io::BufReader::new(file);
        let replay = bincode::deserialize_from(reader)?;
        Ok(replay)
    }

    /// Samples a uniform batch without replacement, leaving insertion order
    /// untouched so FIFO eviction is unaffected by sampling.
    pub fn sample(
        &self,
        batch_size: usize,
        dev: &Device,
        rng: &mut SmallRng,
    ) -> Result<BatchTensors> {
        let len = self.buffer.len();
        assert!(len >= batch_size);

        let mut states = Vec::with_capacity(batch_size * STATE_DIM);
        let mut next_states = Vec::with_capacity(batch_size * STATE_DIM);
        let mut actions = Vec::with_capacity(batch_size);
        let mut rewards = Vec::with_capacity(batch_size);

        for idx in rand::seq::index::sample(rng, len, batch_size) {
            let e = &self.buffer[idx];
            states.extend_from_slice(&e.state);
            next_states.extend_from_slice(&e.next_state);
            actions.push(e.action);
            rewards.push(e.reward);
        }

        Ok(BatchTensors {
            states: Tensor::from_vec(states, (batch_size, STATE_DIM), dev)?,
            next_states: Tensor::from_vec(next_states, (batch_size, STATE_DIM), dev)?,
            actions,
            rewards,
        })
    }
}

pub struct BatchTensors {
    pub states: Tensor,
    pub next_states: Tensor,
    pub actions: Vec<usize>,
    pub rewards: Vec<f32>,
}

// =============================================================================
// Q-Network (candle)
// =============================================================================

/// Feed-forward Q-function approximator.
/// Input: STATE_DIM features → two ReLU hidden layers → Action::COUNT Q-values
pub struct QNet {
    fc1: Linear,
    fc2: Linear,
    out: Linear,
}

impl QNet {
    pub fn new(vs: VarBuilder, config: &AgentConfig) -> Result<Self> {
        let fc1 = candle_nn::linear(config.state_dim, config.hidden1, vs.pp("fc1"))?;
        let fc2 = candle_nn::linear(config.hidden1, config.hidden2, vs.pp("fc2"))?;
        let out = candle_nn::linear(config.hidden2, config.action_count, vs.pp("out"))?;
        Ok(Self { fc1, fc2, out })
    }

    /// Forward pass: state batch → Q-values for all actions. Never mutates
    /// weights; learning happens only through `QAgent::fit`.
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.fc1.forward(x)?.relu()?;
        let h = self.fc2.forward(&h)?.relu()?;
        self.out.forward(&h)
    }
}

// =============================================================================
// Training Metrics
// =============================================================================

/// One immutable record per completed training step.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingMetrics {
    pub episode_number: u64,
    pub total_reward: f64,
    pub average_reward: f64,
    pub exploration_rate: f64,
    pub loss: f32,
    /// One fraction per action over the trained batch; sums to 1.
    pub action_distribution: Vec<f32>,
    pub timestamp_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Model Persistence
// =============================================================================

/// Architecture metadata saved next to the weights. Enough to rebuild the
/// optimizer on load; loading weights without recompiling the optimizer would
/// leave `fit` running with stale parameters.
#[derive(Serialize, Deserialize)]
struct ModelMeta {
    state_dim: usize,
    action_count: usize,
    hidden1: usize,
    hidden2: usize,
    learning_rate: f64,
    saved_at_ms: u64,
}

const WEIGHTS_FILE: &str = "model.safetensors";
const META_FILE: &str = "model.meta.json";
const REPLAY_FILE: &str = "replay.bin";

// =============================================================================
// Q-Learning Agent
// =============================================================================

fn build_model(
    device: &Device,
    config: &AgentConfig,
    learning_rate: f64,
) -> Result<(VarMap, QNet, AdamW)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let net = QNet::new(vb, config)?;
    let optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: learning_rate,
            ..Default::default()
        },
    )?;
    Ok((varmap, net, optimizer))
}

/// Epsilon-greedy Q-learning agent. Owns the network, the replay buffer and
/// the metrics reporter; both die with the agent or on `reset`.
pub struct QAgent {
    varmap: VarMap,
    net: QNet,
    optimizer: AdamW,
    device: Device,
    config: LearningConfig,
    agent_config: AgentConfig,
    initial_exploration: f64,
    replay: ReplayBuffer,
    pub reporter: MetricsReporter,
    rng: SmallRng,
}

impl std::fmt::Debug for QAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QAgent").finish_non_exhaustive()
    }
}

impl QAgent {
    pub fn new(device: &Device, agent_config: AgentConfig, config: LearningConfig) -> Result<Self> {
        if agent_config.state_dim != STATE_DIM {
            return Err(ConfigMismatch {
                what: "network input width",
                expected: STATE_DIM,
                got: agent_config.state_dim,
            }
            .into());
        }
        if agent_config.action_count != Action::COUNT {
            return Err(ConfigMismatch {
                what: "network output width",
                expected: Action::COUNT,
                got: agent_config.action_count,
            }
            .into());
        }

        let (varmap, net, optimizer) = build_model(device, &agent_config, config.learning_rate)?;
        let rng = match agent_config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        Ok(Self {
            varmap,
            net,
            optimizer,
            device: device.clone(),
            initial_exploration: config.exploration_rate,
            replay: ReplayBuffer::new(agent_config.replay_capacity),
            reporter: MetricsReporter::new(),
            rng,
            config,
            agent_config,
        })
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    pub fn batch_size(&self) -> usize {
        self.agent_config.batch_size
    }

    /// Q-value estimates for a single state. Read-only.
    pub fn q_values(&self, state: &Features) -> Result<Vec<f32>> {
        let s = Tensor::from_slice(state, (1, STATE_DIM), &self.device)?;
        let q = self.net.forward(&s)?;
        Ok(q.squeeze(0)?.to_vec1::<f32>()?)
    }

    /// Epsilon-greedy selection: explore uniformly with probability epsilon,
    /// otherwise take the argmax (ties go to the lowest index). Every choice
    /// is published to the action feed.
    pub fn select_action(&mut self, state: &Features) -> Result<usize> {
        let action = if self.rng.random::<f64>() < self.config.exploration_rate {
            self.rng.random_range(0..Action::COUNT)
        } else {
            argmax_first(&self.q_values(state)?)
        };
        self.reporter.publish_action(action);
        Ok(action)
    }

    /// Records a transition. Never blocks, never fails; the buffer evicts its
    /// oldest entry when full.
    pub fn add_experience(&mut self, state: Features, action: usize, reward: f32, next_state: Features) {
        self.replay.push(Experience {
            state,
            action,
            reward,
            next_state,
        });
    }

    /// One batched Q-learning update. Returns `None` while the buffer holds
    /// fewer than `batch_size` transitions — an expected outcome early in
    /// training, not an error.
    ///
    /// Targets use the current network for both the acted-on state and the
    /// next state (no target network), so they are non-stationary; only the
    /// taken action's component is overwritten with the Bellman backup, the
    /// rest keep their predicted values.
    pub fn train_step(&mut self) -> Result<Option<TrainingMetrics>> {
        if self.replay.len() < self.agent_config.batch_size {
            return Ok(None);
        }
        let batch_size = self.agent_config.batch_size;
        let batch = self.replay.sample(batch_size, &self.device, &mut self.rng)?;

        let q_now = self.net.forward(&batch.states)?.detach().to_vec2::<f32>()?;
        let q_next = self
            .net
            .forward(&batch.next_states)?
            .detach()
            .to_vec2::<f32>()?;

        let gamma = self.config.discount_factor as f32;
        let mut targets = q_now;
        for (i, row) in targets.iter_mut().enumerate() {
            let max_next = q_next[i].iter().copied().fold(f32::NEG_INFINITY, f32::max);
            row[batch.actions[i]] = batch.rewards[i] + gamma * max_next;
        }
        let flat: Vec<f32> = targets.into_iter().flatten().collect();
        let target_tensor = Tensor::from_vec(flat, (batch_size, Action::COUNT), &self.device)?;

        let loss = self.fit(&batch.states, &target_tensor, 1)?;

        let total_reward: f64 = batch.rewards.iter().map(|&r| r as f64).sum();
        let mut counts = vec![0usize; Action::COUNT];
        for &a in &batch.actions {
            counts[a] += 1;
        }
        let metrics = TrainingMetrics {
            episode_number: self.reporter.history().len() as u64 + 1,
            total_reward,
            average_reward: total_reward / batch_size as f64,
            exploration_rate: self.config.exploration_rate,
            loss,
            action_distribution: counts
                .into_iter()
                .map(|c| c as f32 / batch_size as f32)
                .collect(),
            timestamp_ms: now_ms(),
        };
        self.reporter.publish_metrics(metrics.clone());
        self.reporter
            .log(format!("training episode {} complete", metrics.episode_number));
        Ok(Some(metrics))
    }

    /// Gradient-descent passes minimizing MSE between predictions and
    /// targets. The only operation that mutates the weights.
    pub fn fit(&mut self, states: &Tensor, targets: &Tensor, epochs: usize) -> Result<f32> {
        let mut last_loss = 0.0f32;
        for _ in 0..epochs.max(1) {
            let preds = self.net.forward(states)?;
            let loss = candle_nn::loss::mse(&preds, targets)?;
            let grads = loss.backward()?;
            self.optimizer.step(&grads)?;
            last_loss = loss.to_scalar::<f32>()?;
        }
        Ok(last_loss)
    }

    /// Multiplicative exploration decay toward a hard floor. Called once per
    /// completed training step, never while the buffer is still filling.
    pub fn decay_exploration(&mut self) {
        let floored = (self.config.exploration_rate * self.agent_config.epsilon_decay)
            .max(self.agent_config.epsilon_floor);
        self.config.exploration_rate = floored;
        self.reporter
            .log(format!("exploration rate: {floored:.4}"));
    }

    /// Discards buffer, metrics history and learned weights, restoring the
    /// initial configuration.
    pub fn reset(&mut self) -> Result<()> {
        self.replay.clear();
        self.reporter.clear_history();
        self.config.exploration_rate = self.initial_exploration;
        let (varmap, net, optimizer) =
            build_model(&self.device, &self.agent_config, self.config.learning_rate)?;
        self.varmap = varmap;
        self.net = net;
        self.optimizer = optimizer;
        self.reporter.log("learning process reset");
        Ok(())
    }

    /// Merges a partial config. A learning-rate change rebuilds the optimizer
    /// over the existing weights (optimizer state is reset, weights kept).
    pub fn update_config(&mut self, update: LearningConfigUpdate) -> Result<()> {
        if let Some(gamma) = update.discount_factor {
            self.config.discount_factor = gamma;
        }
        if let Some(eps) = update.exploration_rate {
            self.config.exploration_rate = eps;
        }
        if let Some(lr) = update.learning_rate {
            self.config.learning_rate = lr;
            self.optimizer = AdamW::new(
                self.varmap.all_vars(),
                ParamsAdamW {
                    lr,
                    ..Default::default()
                },
            )?;
        }
        self.reporter.log("learning configuration updated");
        Ok(())
    }

    /// Persists weights, the architecture metadata needed to recompile the
    /// optimizer on load, and a replay-buffer snapshot for resuming.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.varmap.save(dir.join(WEIGHTS_FILE))?;
        self.replay.save(dir.join(REPLAY_FILE))?;
        let meta = ModelMeta {
            state_dim: self.agent_config.state_dim,
            action_count: self.agent_config.action_count,
            hidden1: self.agent_config.hidden1,
            hidden2: self.agent_config.hidden2,
            learning_rate: self.config.learning_rate,
            saved_at_ms: now_ms(),
        };
        let file = File::create(dir.join(META_FILE))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &meta)?;
        info!(dir = %dir.display(), "model saved");
        Ok(())
    }

    /// Restores a saved model. Any persistence failure is logged and answered
    /// with freshly initialized weights; the caller never sees the error.
    pub fn load<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        match self.try_load(dir) {
            Ok(()) => {
                info!(dir = %dir.display(), "model loaded");
                Ok(())
            }
            Err(err) => {
                warn!(dir = %dir.display(), %err, "model load failed, starting fresh");
                self.reporter
                    .log(format!("model load failed ({err:#}), starting with fresh weights"));
                let (varmap, net, optimizer) =
                    build_model(&self.device, &self.agent_config, self.config.learning_rate)?;
                self.varmap = varmap;
                self.net = net;
                self.optimizer = optimizer;
                Ok(())
            }
        }
    }

    fn try_load(&mut self, dir: &Path) -> Result<()> {
        let file = File::open(dir.join(META_FILE)).context("missing model metadata")?;
        let meta: ModelMeta = serde_json::from_reader(std::io::BufReader::new(file))
            .context("unreadable model metadata")?;
        anyhow::ensure!(
            meta.state_dim == self.agent_config.state_dim
                && meta.action_count == self.agent_config.action_count
                && meta.hidden1 == self.agent_config.hidden1
                && meta.hidden2 == self.agent_config.hidden2,
            "saved architecture does not match this agent"
        );
        self.varmap.load(dir.join(WEIGHTS_FILE))?;
        // Checkpoints written before replay snapshots existed lack the file;
        // resume with whatever the buffer currently holds.
        let replay_path = dir.join(REPLAY_FILE);
        if replay_path.exists() {
            match ReplayBuffer::load(&replay_path) {
                Ok(replay) => self.replay = replay,
                Err(err) => {
                    warn!(%err, "replay snapshot unreadable, keeping current buffer");
                }
            }
        }
        // Recompile the optimizer before any further fit call; loading
        // weights alone would leave it bound to stale parameters.
        self.config.learning_rate = meta.learning_rate;
        self.optimizer = AdamW::new(
            self.varmap.all_vars(),
            ParamsAdamW {
                lr: meta.learning_rate,
                ..Default::default()
            },
        )?;
        Ok(())
    }
}

/// Argmax with ties resolved to the first index.
pub fn argmax_first(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exp(tag: f32) -> Experience {
        Experience {
            state: [tag; STATE_DIM],
            action: 0,
            reward: tag,
            next_state: [tag; STATE_DIM],
        }
    }

    #[test]
    fn buffer_evicts_oldest_first() {
        let mut buf = ReplayBuffer::new(3);
        for tag in [1.0, 2.0, 3.0, 4.0] {
            buf.push(exp(tag));
        }
        assert_eq!(buf.len(), 3);
        let tags: Vec<f32> = buf.iter().map(|e| e.reward).collect();
        assert_eq!(tags, vec![2.0, 3.0, 4.0]);

        buf.push(exp(5.0));
        let tags: Vec<f32> = buf.iter().map(|e| e.reward).collect();
        assert_eq!(tags, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn buffer_never_exceeds_capacity() {
        let mut buf = ReplayBuffer::new(8);
        for i in 0..100 {
            buf.push(exp(i as f32));
            assert!(buf.len() <= 8);
        }
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn sample_draws_from_current_contents_without_reordering() {
        let mut buf = ReplayBuffer::new(10);
        for i in 0..10 {
            buf.push(exp(i as f32));
        }
        let mut rng = SmallRng::seed_from_u64(1);
        let batch = buf.sample(4, &Device::Cpu, &mut rng).unwrap();
        assert_eq!(batch.actions.len(), 4);
        assert_eq!(batch.rewards.len(), 4);
        for r in &batch.rewards {
            assert!((0.0..10.0).contains(r));
        }
        // Sampling must not disturb insertion order.
        let tags: Vec<f32> = buf.iter().map(|e| e.reward).collect();
        assert_eq!(tags, (0..10).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn exploration_decays_to_floor() {
        let device = Device::Cpu;
        let config = LearningConfig {
            exploration_rate: 0.5,
            ..Default::default()
        };
        let mut agent = QAgent::new(&device, AgentConfig::default(), config).unwrap();

        agent.decay_exploration();
        assert!((agent.config().exploration_rate - 0.495).abs() < 1e-12);

        for _ in 0..2_000 {
            agent.decay_exploration();
        }
        assert!((agent.config().exploration_rate - 0.01).abs() < 1e-12);
    }

    #[test]
    fn mismatched_dims_fail_fast() {
        let device = Device::Cpu;
        let bad = AgentConfig {
            state_dim: STATE_DIM + 1,
            ..Default::default()
        };
        let err = QAgent::new(&device, bad, LearningConfig::default()).unwrap_err();
        assert!(err.downcast_ref::<ConfigMismatch>().is_some());
    }

    #[test]
    fn argmax_breaks_ties_on_first_index() {
        assert_eq!(argmax_first(&[1.0, 1.0, 0.5]), 0);
        assert_eq!(argmax_first(&[0.0, 2.0, 2.0]), 1);
        assert_eq!(argmax_first(&[-1.0, -0.5, -2.0]), 1);
    }
}
