use std::path::PathBuf;

use thiserror::Error;

/// Error reported by an instruction executor.
///
/// The build engine never interprets these; it wraps them in
/// [`ForgeError::ExecutionError`] together with the failing stage and step.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The executed command returned a non-zero status
    #[error("command exited with status {code}: {message}")]
    CommandFailed { code: i32, message: String },

    /// The executor does not know how to run this instruction
    #[error("unsupported instruction: {0}")]
    Unsupported(String),

    /// The executor observed the build's cancellation signal
    #[error("execution cancelled")]
    Cancelled,

    /// I/O failure inside the executor
    #[error("executor I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other executor failure
    #[error("{0}")]
    Other(String),
}

/// A3S Forge error types
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Build context root could not be read
    #[error("Context error at {path}: {message}")]
    ContextError { path: PathBuf, message: String },

    /// Ignore rule is not a valid glob pattern
    #[error("Invalid ignore rule '{pattern}': {message}")]
    InvalidIgnoreRule { pattern: String, message: String },

    /// A stage references a stage that does not exist
    #[error("Unknown stage '{name}' referenced by stage '{referenced_by}'")]
    UnknownStage { name: String, referenced_by: String },

    /// Two stages share the same name
    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    /// The requested build target is not a stage
    #[error("Unknown build target: {0}")]
    UnknownTarget(String),

    /// The stage graph contains a cycle
    #[error("Stage graph contains a cycle through stage '{stage}'")]
    CycleDetected { stage: String },

    /// An instruction failed inside the executor
    #[error("Stage '{stage}' failed at instruction {index} ({instruction}): {source}")]
    ExecutionError {
        stage: String,
        index: usize,
        instruction: String,
        #[source]
        source: ExecutorError,
    },

    /// A stage was not run because a stage it depends on failed
    #[error("Stage '{stage}' not built: dependency '{dependency}' failed")]
    DependencyFailed { stage: String, dependency: String },

    /// Image assembly invariant violated
    #[error("Assembly error: {0}")]
    AssemblyError(String),

    /// Cache store failure
    #[error("Cache error: {0}")]
    CacheError(String),

    /// The build was cancelled between or during instructions
    #[error("Build cancelled in stage '{stage}' at instruction {index}")]
    Cancelled { stage: String, index: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Coarse classification of a [`ForgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Context,
    Graph,
    Execution,
    Assembly,
    Cache,
    Cancelled,
    Config,
    Io,
}

impl ForgeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ContextError { .. } | Self::InvalidIgnoreRule { .. } => ErrorKind::Context,
            Self::UnknownStage { .. }
            | Self::DuplicateStage(_)
            | Self::UnknownTarget(_)
            | Self::CycleDetected { .. } => ErrorKind::Graph,
            Self::ExecutionError { .. } | Self::DependencyFailed { .. } => ErrorKind::Execution,
            Self::AssemblyError(_) => ErrorKind::Assembly,
            Self::CacheError(_) => ErrorKind::Cache,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ConfigError(_) => ErrorKind::Config,
            Self::IoError(_) | Self::SerializationError(_) => ErrorKind::Io,
        }
    }

    /// Stage name and instruction index of the step that failed, if any.
    pub fn failed_step(&self) -> Option<(&str, usize)> {
        match self {
            Self::ExecutionError { stage, index, .. } | Self::Cancelled { stage, index } => {
                Some((stage.as_str(), *index))
            }
            _ => None,
        }
    }

    /// Whether this error indicates an internal defect rather than a
    /// problem with the build definition or its environment.
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::AssemblyError(_))
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ForgeError {
    fn from(err: serde_yaml::Error) -> Self {
        ForgeError::SerializationError(err.to_string())
    }
}

/// Result type alias for A3S Forge operations
pub type Result<T> = std::result::Result<T, ForgeError>;
