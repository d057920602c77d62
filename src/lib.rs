//! # inet-fusion
//!
//! Knowledge-distillation training of an image fusion network against a
//! frozen invertible ResNet, plus the evaluation modes used to analyse the
//! backbone. Built on the Burn ML framework.
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration loading and validation
//! - [`experiment`] — Path layout, directories, datasets, backbone setup
//! - [`data`] — Dataset readers, in-memory splits, batch loading, `.npy` I/O
//! - [`model`] — Backbone and fusion traits with their burn modules
//! - [`loss`] — Distillation, cross-entropy and MSE losses
//! - [`fusion`] — Actor stacks and latent recovery
//! - [`training`] — Fusion trainer, learning-rate schedule, running metrics
//! - [`checkpoint`] — Weights plus metadata sidecars
//! - [`analysis`] — Evaluation modes and the `analyse` dispatcher
//! - [`dashboard`] — Client for a visdom-compatible server
//! - [`imaging`] — Image grids and scatter plots
//! - [`logging`] — Tracing subscriber setup
//! - [`error`] — Structured error types

#![recursion_limit = "256"]

pub mod analysis;
pub mod checkpoint;
pub mod config;
pub mod dashboard;
pub mod data;
pub mod error;
pub mod experiment;
pub mod fusion;
pub mod imaging;
pub mod logging;
pub mod loss;
pub mod model;
pub mod training;
