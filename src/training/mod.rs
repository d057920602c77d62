//! Fusion training: learning-rate schedule, running metrics and the epoch
//! loop.

pub mod metrics;
pub mod schedule;
pub mod trainer;

pub use metrics::{accuracy_topk, AverageMeter, EpochMetrics, ThroughputMeter};
pub use schedule::{LrPolicy, LrSchedule};
pub use trainer::{FusionTrainer, TrainOutcome, TrainerConfig};
