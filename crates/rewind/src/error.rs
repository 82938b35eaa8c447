#![forbid(unsafe_code)]

//! Error taxonomy for command registration and execution.
//!
//! Errors never cross the public `execute` boundary as values a caller must
//! handle: [`crate::Engine::execute`] converts every failure to
//! `(false, None)` after logging it. The enum exists so internal paths can
//! propagate with `?` and so tests can assert on specific failure kinds.

use std::fmt;

/// Result alias for command execution: an optional return value on success.
pub type CommandResult = Result<Option<crate::ArgValue>, CommandError>;

/// Errors raised by the registry, executor, and undo engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No command registered under the given name.
    NotFound(String),
    /// Several modules registered the short name; a qualifier is required.
    Ambiguous {
        /// The short name that was looked up.
        name: String,
        /// Modules that registered it, sorted.
        modules: Vec<String>,
    },
    /// A registration was rejected (empty name, duplicate token, ...).
    InvalidRegistration(String),
    /// A required keyword argument was not supplied.
    MissingArgument {
        /// Qualified command name.
        command: String,
        /// Name of the missing argument.
        argument: String,
    },
    /// An argv vector could not be turned into keyword arguments.
    ArgvParse {
        /// Qualified command name.
        command: String,
        /// What went wrong.
        message: String,
    },
    /// A command's `apply` or `revert` failed.
    Execution {
        /// Qualified command name.
        command: String,
        /// Failure description from the command.
        message: String,
    },
    /// Engine-internal failure (poisoned instance lock, broken invariant).
    Internal(String),
}

impl CommandError {
    /// Shorthand for an execution failure.
    #[must_use]
    pub fn execution(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            command: command.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "command '{name}' not found"),
            Self::Ambiguous { name, modules } => write!(
                f,
                "command '{name}' is ambiguous; qualify with one of: {}",
                modules.join(", ")
            ),
            Self::InvalidRegistration(msg) => write!(f, "invalid registration: {msg}"),
            Self::MissingArgument { command, argument } => {
                write!(f, "command '{command}' missing required argument '{argument}'")
            }
            Self::ArgvParse { command, message } => {
                write!(f, "cannot build arguments for '{command}': {message}")
            }
            Self::Execution { command, message } => {
                write!(f, "command '{command}' failed: {message}")
            }
            Self::Internal(msg) => write!(f, "internal engine error: {msg}"),
        }
    }
}

impl std::error::Error for CommandError {}

// ============================================================================
// Tests
// ============================================================================
