// =============================================================================
// drive-rl — DQN autopilot for a procedurally generated driving track
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- train --steps 2000 --target-reward 100
//   cargo run --release -- play  --model checkpoints --episodes 5
//   cargo run --release -- baseline --episodes 5

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use drive_rl::{
    run_eval, Action, AgentConfig, DriveEnv, EnvConfig, LearningConfig, QAgent, RewardConfig,
    StopReason, Trainer, TrainerConfig,
};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "drive-rl", about = "Driving-sim DQN autopilot")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the Q-learning agent with early stopping
    Train(TrainArgs),
    /// Watch the trained agent drive (greedy policy)
    Play(PlayArgs),
    /// Run a random-action baseline
    Baseline(BaselineArgs),
}

#[derive(Parser)]
struct TrainArgs {
    /// Maximum number of completed training steps
    #[arg(long, default_value = "2000")]
    steps: u64,
    /// Stop early once the average batch reward exceeds this
    #[arg(long, default_value = "100.0")]
    target_reward: f64,
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,
    /// Resume from a previously saved checkpoint directory
    #[arg(long)]
    resume: Option<PathBuf>,
    #[arg(long, default_value = "0.001")]
    learning_rate: f64,
    #[arg(long, default_value = "0.99")]
    gamma: f64,
    #[arg(long, default_value = "0.1")]
    epsilon: f64,
    /// Environment seed for reproducible tracks
    #[arg(long, default_value = "0")]
    seed: u64,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct PlayArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long, default_value = "5")]
    episodes: usize,
    #[arg(long, default_value = "0")]
    seed: u64,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct BaselineArgs {
    #[arg(long, default_value = "5")]
    episodes: usize,
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn select_device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0).unwrap_or(Device::Cpu)
    }
}

// =============================================================================
// Commands
// =============================================================================

fn train(args: &TrainArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  TRAINING — drive-rl DQN autopilot (Rust + candle)");
    eprintln!("═══════════════════════════════════════════════════════════");

    let device = select_device(args.cpu);
    eprintln!("Device: {device:?}");

    let learning = LearningConfig {
        learning_rate: args.learning_rate,
        discount_factor: args.gamma,
        exploration_rate: args.epsilon,
    };
    let mut agent = QAgent::new(&device, AgentConfig::default(), learning)?;
    if let Some(resume_dir) = args.resume.as_ref() {
        agent.load(resume_dir)?;
        eprintln!("📦 Resumed from {}", resume_dir.display());
    }

    let env = DriveEnv::new(EnvConfig::default(), RewardConfig::default(), args.seed);
    let mut trainer = Trainer::new(agent, env, TrainerConfig::default());
    let metrics_feed = trainer.agent.reporter.subscribe_metrics();

    let stop = AtomicBool::new(false);
    let reason = trainer.run_with_early_stopping(args.steps, args.target_reward, &stop)?;

    for m in metrics_feed.try_iter() {
        if m.episode_number % 100 == 0 {
            eprintln!(
                "Ep {:>5} | R {:>8.2} | Avg {:>7.2} | ε {:.4} | Loss {:.5}",
                m.episode_number, m.total_reward, m.average_reward, m.exploration_rate, m.loss,
            );
        }
    }

    match reason {
        StopReason::TargetReached { step } => {
            eprintln!("✅ Target reward reached at step {step}")
        }
        StopReason::MaxSteps => eprintln!("✅ Training complete ({} steps)", args.steps),
        StopReason::Cancelled => eprintln!("⏹ Training cancelled"),
    }

    trainer.agent.save(&args.checkpoint_dir)?;
    eprintln!("💾 Model saved to {}", args.checkpoint_dir.display());
    eprintln!("\n{}", trainer.agent.reporter.report());
    Ok(())
}

fn play(args: &PlayArgs) -> Result<()> {
    let device = select_device(args.cpu);
    let mut agent = QAgent::new(&device, AgentConfig::default(), LearningConfig::default())?;
    agent.load(&args.model)?;

    let mut env = DriveEnv::new(EnvConfig::default(), RewardConfig::default(), args.seed);
    let stats = run_eval(&agent, &mut env, args.episodes)?;
    eprintln!(
        "Episodes {} | Avg Reward {:.2} | Avg Collisions {:.1} | Avg Checkpoints {:.1}",
        stats.episodes, stats.avg_reward, stats.avg_collisions, stats.avg_checkpoints,
    );
    Ok(())
}

fn baseline(args: &BaselineArgs) -> Result<()> {
    let mut env = DriveEnv::new(EnvConfig::default(), RewardConfig::default(), args.seed);
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let mut total = 0.0f64;
    for _ in 0..args.episodes.max(1) {
        env.reset();
        loop {
            let action = Action::from_index(rng.random_range(0..Action::COUNT));
            let result = env.step(action);
            total += result.reward as f64;
            if result.done {
                break;
            }
        }
    }
    eprintln!(
        "Random baseline: {:.2} avg reward over {} episodes",
        total / args.episodes.max(1) as f64,
        args.episodes.max(1),
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => train(args),
        Commands::Play(args) => play(args),
        Commands::Baseline(args) => baseline(args),
    }
}
