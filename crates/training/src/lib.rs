#![recursion_limit = "256"]

pub mod config;
pub mod dump;
pub mod metrics;
pub mod schedule;
pub mod train_loop;
pub mod util;

pub use config::{
    parse_flag, validate_backend_choice, BackendKind, EvalArgs, TrainArgs, TrainConfig,
};
pub use dump::dump_predictions;
pub use metrics::RunningLoss;
pub use models::{ResNet, ResNetConfig, ScoreRegressor};
pub use schedule::step_lr_scheduler;
pub use train_loop::{evaluate_loss, mae_loss, train_model, EpochStats, LoopConfig, TrainReport};
pub use util::{eval_with_config, run_eval, run_train, train_with_config, RunSummary};
/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
