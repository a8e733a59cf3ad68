use thiserror::Error;

/// Main error type for the corral supervisor
#[derive(Debug, Error)]
pub enum CorralError {
    // Spec and configuration errors
    #[error("Invalid process spec: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    // Instance lifecycle errors
    #[error("Failed to spawn {0}: {1}")]
    Spawn(String, String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to stop {0}: {1}")]
    Stop(String, String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("A reload is already in progress")]
    ReloadConflict,

    // Log errors
    #[error("Log error: {0}")]
    Log(String),

    #[error("Failed to open log file: {0}")]
    LogFile(String),

    // Operator interface errors
    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Failed to connect to daemon: {0}")]
    Connection(String),

    #[error("IPC protocol error: {0}")]
    Protocol(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for corral operations
pub type Result<T> = std::result::Result<T, CorralError>;
