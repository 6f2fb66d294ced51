use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::{QAgent, TrainingMetrics};
use crate::env::{encode, Action, DriveEnv};

pub struct TrainerConfig {
    /// Simulation ticks fed to the buffer between training steps.
    pub rollout_ticks: usize,
    /// Wait before retrying when the buffer is still below batch size.
    pub backoff: Duration,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            rollout_ticks: 32,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Average batch reward exceeded the target at this training step.
    TargetReached { step: u64 },
    MaxSteps,
    Cancelled,
}

/// Drives repeated rollout-or-train cycles against the environment.
///
/// At most one training step is ever in flight; the guard flag makes that
/// explicit rather than relying on call ordering.
pub struct Trainer {
    pub agent: QAgent,
    pub env: DriveEnv,
    config: TrainerConfig,
    step_in_flight: AtomicBool,
}

impl Trainer {
    pub fn new(agent: QAgent, env: DriveEnv, config: TrainerConfig) -> Self {
        Self {
            agent,
            env,
            config,
            step_in_flight: AtomicBool::new(false),
        }
    }

    /// Runs the simulation for `ticks` ticks, feeding each transition to the
    /// agent. Episodes that end mid-rollout reset the environment and
    /// continue. Returns the reward accumulated across the rollout.
    pub fn rollout(&mut self, ticks: usize) -> Result<f64> {
        let mut obs = self.env.observe();
        let mut total = 0.0f64;
        for _ in 0..ticks {
            let state = encode(&obs);
            let action = self.agent.select_action(&state)?;
            let result = self.env.step(Action::from_index(action));
            self.agent
                .add_experience(state, action, result.reward, encode(&result.observation));
            total += result.reward as f64;
            obs = if result.done {
                self.env.reset()
            } else {
                result.observation
            };
        }
        Ok(total)
    }

    fn train_step_guarded(&mut self) -> Result<Option<TrainingMetrics>> {
        if self.step_in_flight.swap(true, Ordering::Acquire) {
            anyhow::bail!("training step already in flight");
        }
        let outcome = self.agent.train_step();
        self.step_in_flight.store(false, Ordering::Release);
        outcome
    }

    /// Trains until `max_steps` completed steps, the target average batch
    /// reward is reached, or the stop flag is raised. The flag is checked
    /// between iterations only; an in-flight step always runs to completion.
    ///
    /// A failed training step is logged and skipped — the loop keeps going.
    /// Only unrecoverable configuration errors surface before this loop ever
    /// starts, at agent construction.
    pub fn run_with_early_stopping(
        &mut self,
        max_steps: u64,
        target_average_reward: f64,
        stop: &AtomicBool,
    ) -> Result<StopReason> {
        let mut step = 0u64;
        while step < max_steps {
            if stop.load(Ordering::Relaxed) {
                info!("training cancelled after {step} steps");
                return Ok(StopReason::Cancelled);
            }
            self.rollout(self.config.rollout_ticks)?;
            match self.train_step_guarded() {
                Ok(Some(metrics)) => {
                    step += 1;
                    if metrics.average_reward > target_average_reward {
                        info!(
                            step,
                            average_reward = metrics.average_reward,
                            "target reward reached"
                        );
                        self.agent
                            .reporter
                            .log(format!("target reward reached in episode {step}"));
                        return Ok(StopReason::TargetReached { step });
                    }
                    self.agent.decay_exploration();
                }
                Ok(None) => {
                    // Buffer still filling; back off instead of spinning.
                    std::thread::sleep(self.config.backoff);
                }
                Err(err) => {
                    warn!(%err, "training step failed, continuing");
                    self.agent
                        .reporter
                        .log(format!("training step failed: {err:#}"));
                }
            }
        }
        Ok(StopReason::MaxSteps)
    }
}
