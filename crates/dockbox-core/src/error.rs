use thiserror::Error;

/// Boxed cause of a failed call to the container runtime.
pub type RuntimeSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DockboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("The provided profile name {0} has no associated profile")]
    UnknownProfile(String),

    #[error("Shell {0} not recognised")]
    UnknownShell(String),

    #[error("{0} not formatted correctly as local-path:remote-path")]
    InvalidBinding(String),

    #[error("Container {0} was not created by this engine and has no profile assigned to it")]
    UntrackedContainer(String),

    #[error("Working directory {0} has not been opened or has been closed")]
    WorkingDirectoryClosed(String),

    #[error("Working directory {0} must be closed before another one is opened")]
    WorkingDirectoryActive(String),

    #[error("Sandbox has not been started")]
    NotStarted,

    #[error("Runtime call {operation} failed: {source}")]
    Runtime {
        operation: &'static str,
        #[source]
        source: RuntimeSource,
    },

    #[error("Failed to remove volume {volume}, it is still in use: {source}")]
    VolumeInUse {
        volume: String,
        #[source]
        source: RuntimeSource,
    },

    #[error("Failed to write stdin to container {container_id}: {source}")]
    Stdin {
        container_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build upload archive: {0}")]
    Archive(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DockboxError {
    /// Wraps a runtime client failure, remembering which call produced it.
    pub fn runtime<E>(operation: &'static str, source: E) -> Self
    where
        E: Into<RuntimeSource>,
    {
        DockboxError::Runtime {
            operation,
            source: source.into(),
        }
    }

    /// True for caller mistakes that are rejected before the runtime is contacted.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DockboxError::Config(_)
                | DockboxError::UnknownProfile(_)
                | DockboxError::UnknownShell(_)
                | DockboxError::InvalidBinding(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DockboxError>;
