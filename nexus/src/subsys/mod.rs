//! Supervisor subsystems: the pipeline document loader and the optional
//! watcher actor.

pub mod config;
pub mod watcher;

pub use config::{
    ActorSpec, CliOverrides, ConfigError, LinkTuning, Persistence, PipelineSpec,
    Settings, StoreBackend,
};
pub use watcher::Watcher;
