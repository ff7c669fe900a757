//! Error types for stagebuild
//!
//! All modules use `BuildResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for stagebuild operations
pub type BuildResult<T> = Result<T, BuildError>;

/// All errors that can occur in stagebuild
#[derive(Error, Debug)]
pub enum BuildError {
    // Store errors
    #[error("Store I/O error while {context} ({path}): {source}")]
    StoreIo {
        context: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store object {id}: {reason}")]
    CorruptObject { id: String, reason: String },

    #[error("Invalid branch name {name:?}: {reason}")]
    InvalidBranch { name: String, reason: String },

    #[error("Checkout destination is not empty: {0}")]
    CheckoutNotEmpty(PathBuf),

    #[error("No transaction in progress")]
    NoTransaction,

    #[error("A transaction is already in progress")]
    TransactionActive,

    // Cache engine errors
    #[error("Stage ordering violated: {0}")]
    StageOrder(String),

    #[error("Garbage collection failed: {0}")]
    Gc(String),

    // Manifest errors
    #[error("Invalid manifest at {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("Module not found in manifest: {0}")]
    ModuleNotFound(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, exit code: {code}")]
    CommandExecution { command: String, code: i32 },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl BuildError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a store I/O error with operation context and the path involved
    pub fn store_io(
        context: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::StoreIo {
            context: context.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a corrupt object error
    pub fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptObject {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::CorruptObject { .. } => {
                Some("Remove the cache directory under the state dir to start fresh")
            }
            Self::CheckoutNotEmpty(_) => Some("Use --force-clean to empty the app directory"),
            Self::StageOrder(_) => Some("This is a bug in the stage driver, please report it"),
            Self::ModuleNotFound(_) => Some("Check the module names listed in the manifest"),
            _ => None,
        }
    }
}
