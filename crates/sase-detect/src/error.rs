//! Detection engine errors

use crate::generation::GenerationId;
use thiserror::Error;

/// Detection engine errors
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration prefix {0} is already loaded")]
    PrefixExists(String),

    #[error("ruleset compilation failed: {0}")]
    Compile(#[from] sase_ips::IpsError),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("keyword context '{0}' failed to initialize")]
    KeywordInit(String),

    #[error("generation {0} is already registered")]
    DuplicateGeneration(GenerationId),

    #[error("generation {0} is not live")]
    NotLive(GenerationId),

    #[error("generation {0} is already retired")]
    AlreadyRetired(GenerationId),

    #[error("generation {0} is the only live generation")]
    LastLiveGeneration(GenerationId),

    #[error("no active generation")]
    NotInitialized,

    #[error("inspection engine registration failed: {0}")]
    Registration(String),

    #[error("a reload is already in progress")]
    ReloadInProgress,

    #[error("no reload watcher is running")]
    NoReloadWatcher,

    #[error("reload aborted: {0}")]
    Aborted(String),

    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, DetectError>;
