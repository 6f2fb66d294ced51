use anyhow::Result;

use crate::agent::{argmax_first, QAgent};
use crate::env::{encode, Action, DriveEnv};

pub struct EvalStats {
    pub avg_reward: f64,
    pub avg_collisions: f64,
    pub avg_checkpoints: f64,
    pub episodes: usize,
}

/// Runs the greedy policy (no exploration) for a number of episodes and
/// aggregates per-episode statistics.
pub fn run_eval(agent: &QAgent, env: &mut DriveEnv, episodes: usize) -> Result<EvalStats> {
    let episodes = episodes.max(1);
    let mut total_reward = 0.0f64;
    let mut total_collisions = 0u64;
    let mut total_checkpoints = 0u64;

    for _ in 0..episodes {
        let mut obs = env.reset();
        loop {
            let state = encode(&obs);
            let action = argmax_first(&agent.q_values(&state)?);
            let result = env.step(Action::from_index(action));
            total_reward += result.reward as f64;
            if result.collided {
                total_collisions += 1;
            }
            if result.checkpoint {
                total_checkpoints += 1;
            }
            if result.done {
                break;
            }
            obs = result.observation;
        }
    }

    let denom = episodes as f64;
    Ok(EvalStats {
        avg_reward: total_reward / denom,
        avg_collisions: total_collisions as f64 / denom,
        avg_checkpoints: total_checkpoints as f64 / denom,
        episodes,
    })
}
