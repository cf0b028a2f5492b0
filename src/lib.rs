#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod config;
mod core;
pub mod engine;
mod error;
pub mod notifier;
pub mod pipeline;
pub mod tasks;
pub mod transform;
mod utils;

pub use crate::config::{Config, Settings};
pub use crate::core::{Environment, Hash32};
pub use crate::engine::{Action, Blueprint, Scheduler, Task, WatchBinding};
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
