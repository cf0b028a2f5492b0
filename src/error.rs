use std::sync::mpsc::RecvError;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while loading the configuration store. Always fatal at
/// startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file '{0}':\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse configuration:\n{0}")]
    Parse(#[from] toml::de::Error),

    #[error("Missing required configuration key '{0}'")]
    Missing(String),

    #[error("Configuration key '{key}' should be {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("Configuration key '{key}' is malformed: {reason}")]
    Malformed { key: String, reason: String },
}

/// A task depends on itself, directly or through other tasks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Dependency cycle detected at task '{task}'")]
pub struct DependencyCycleError {
    pub task: String,
}

/// Errors raised while validating the task graph, before any task runs.
#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error(transparent)]
    Cycle(#[from] DependencyCycleError),

    #[error("Task '{0}' is declared more than once")]
    Duplicate(String),

    #[error("Task '{task}' refers to unknown task '{missing}'")]
    Unknown { task: String, missing: String },
}

/// Errors raised while validating a pipeline definition.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline '{0}' has no stages")]
    Empty(String),

    #[error("Invalid glob pattern '{0}':\n{1}")]
    Pattern(String, glob::PatternError),

    #[error("Stage '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("Stage '{stage}' reads from '{input}', which is not an earlier stage")]
    ForwardReference { stage: String, input: String },

    #[error("Pipeline option for stage '{stage}' is invalid: {reason}")]
    Option { stage: String, reason: String },
}

/// A single file failed a single stage. Recovered at the stage boundary.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed on '{file}':\n{source}")]
pub struct TransformError {
    pub stage: String,
    pub file: Utf8PathBuf,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error("Path is not valid UTF-8: {0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Couldn't watch '{path}':\n{source}")]
    Setup {
        path: String,
        #[source]
        source: Box<WatchError>,
    },

    #[error("File watcher disconnected")]
    Recv(#[from] RecvError),
}

/// Errors surfaced by a running task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Unknown task '{0}'")]
    Unknown(String),

    #[error("Task '{0}':\n{1}")]
    Failed(String, anyhow::Error),

    #[error("Task '{0}' panicked: {1}")]
    Panicked(String, String),

    #[error("Task '{0}' stopped watching:\n{1}")]
    Watch(String, WatchError),
}
