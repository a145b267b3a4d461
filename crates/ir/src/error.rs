//! Error taxonomy shared by every tunebridge stage.

use std::path::PathBuf;

/// Failures surfaced by target resolution, module loading, tuning and building.
///
/// Each variant maps to a stable wire name via [`Error::kind_name`], which the
/// flat-mapping bridge reports as `error_kind`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The target name does not match any known target class.
    #[error("unknown target '{0}'")]
    InvalidTarget(String),

    /// The serialized module could not be decoded.
    #[error("failed to parse module: {0}")]
    ModuleParse(String),

    /// The baseline pipeline rejected the module structure.
    #[error("normalization rejected task '{task}': {detail}")]
    Normalization { task: String, detail: String },

    /// Database application was requested but no database exists.
    #[error("no tuning database found at '{}'", path.display())]
    DatabaseNotFound { path: PathBuf },

    /// The database was produced for a different target kind.
    #[error("tuning database at '{}' holds '{found}' records, requested target kind is '{requested}'", path.display())]
    TargetMismatch {
        path: PathBuf,
        found: String,
        requested: String,
    },

    /// A candidate or the final module failed to build.
    #[error("build failed for task '{task}': {reason}")]
    Build { task: String, reason: String },

    /// Any other failure raised by the search, measurement or compile engines.
    #[error("engine error: {0}")]
    Engine(String),

    /// A caller-supplied parameter is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("i/o error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wire name of the error kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::InvalidTarget(_) => "InvalidTargetError",
            Error::ModuleParse(_) => "ModuleParseError",
            Error::Normalization { .. } => "NormalizationError",
            Error::DatabaseNotFound { .. } => "DatabaseNotFoundError",
            Error::TargetMismatch { .. } => "TargetMismatchError",
            Error::Build { .. } => "BuildFailure",
            Error::Engine(_) => "EngineError",
            Error::InvalidArgument(_) => "InvalidArgumentError",
            Error::Io { .. } => "IoError",
        }
    }

    pub fn normalization(task: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Normalization {
            task: task.into(),
            detail: detail.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Engine(format!("{err:#}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
