//! Error types for the run supervisor
//!
//! Fatal categories abort a run before (or instead of) reporting a verdict.
//! Pipeline failures are not fatal: the supervisor folds them into an
//! `ERROR(...)` verdict. Cleanup problems are never errors at all, see
//! [`crate::workdir::CleanupWarning`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::process::Phase;

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Malformed or unresolvable run options
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Backend name not present in the registry
    #[error("unknown verifier '{name}' (known verifiers: {known})")]
    UnknownBackend { name: String, known: String },

    /// `--prp` argument is neither a file, a shortcut, nor a property line
    #[error("cannot resolve property '{spec}': {reason}")]
    UnresolvableProperty { spec: String, reason: String },

    /// A flag value failed validation
    #[error("invalid value '{value}' for {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        value: String,
        reason: String,
    },

    /// No input files given
    #[error("no input files given")]
    NoSources,

    /// An input file does not exist
    #[error("input file not found: {}", .0.display())]
    MissingSource(PathBuf),
}

impl ConfigError {
    pub fn invalid(option: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidOption {
            option,
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn property(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::UnresolvableProperty {
            spec: spec.into(),
            reason: reason.into(),
        }
    }
}

/// Missing pieces of the installed toolchain
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DependencyError {
    /// Installation root does not exist or cannot be determined
    #[error("installation root not found: {0}")]
    MissingInstallRoot(String),

    /// Required executable is not on the resolved search path
    #[error("required executable not found: {0}")]
    MissingExecutable(String),

    /// Required shared library is not on the resolved library path
    #[error("required library not found: {0}")]
    MissingLibrary(String),
}

/// Installed toolchain does not match the expected build
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// Version output does not contain the expected fingerprint
    #[error("{tool} does not match the expected build (expected '{expected}', got '{found}')")]
    Mismatch {
        tool: String,
        expected: String,
        found: String,
    },

    /// Version probe could not be run
    #[error("cannot query version of {tool}: {message}")]
    Probe { tool: String, message: String },

    /// Version probe hung
    #[error("version probe of {tool} timed out after {timeout:?}")]
    ProbeTimeout { tool: String, timeout: Duration },
}

/// Failure of one pipeline phase
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Tool could not be started
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Tool ran but exited abnormally
    #[error("{phase} failed: {tool} exited with {status}")]
    ToolFailed {
        phase: Phase,
        tool: String,
        status: String,
        stderr: String,
    },

    /// File handling between phases failed
    #[error("{phase} failed: {source}")]
    Io {
        phase: Phase,
        #[source]
        source: std::io::Error,
    },

    /// The wall-clock timeout fired while the pipeline was running
    #[error("run cancelled by timeout")]
    Cancelled,
}

impl PipelineError {
    pub fn io(phase: Phase, source: std::io::Error) -> Self {
        PipelineError::Io { phase, source }
    }

    /// Short text used inside `ERROR(...)`
    pub fn verdict_message(&self) -> String {
        match self {
            PipelineError::Spawn { tool, .. } => format!("cannot run {tool}"),
            PipelineError::ToolFailed { phase, .. } | PipelineError::Io { phase, .. } => {
                format!("{phase} failed")
            }
            PipelineError::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Fatal outcome of a run
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Working directory could not be created or entered
    #[error("cannot set up working directory {}: {source}", path.display())]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    /// Process exit code for this error category
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::Config(_) => 2,
            SupervisorError::Dependency(_) | SupervisorError::WorkingDirectory { .. } => 3,
            SupervisorError::Integrity(_) => 4,
        }
    }

    /// Short text used inside `ERROR(...)`
    pub fn verdict_message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_lists_known_names() {
        let err = ConfigError::UnknownBackend {
            name: "nope".to_string(),
            known: "klee, cbmc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unknown verifier 'nope' (known verifiers: klee, cbmc)"
        );
    }

    #[test]
    fn exit_codes_per_category() {
        assert_eq!(SupervisorError::from(ConfigError::NoSources).exit_code(), 2);
        assert_eq!(
            SupervisorError::from(DependencyError::MissingLibrary("LLVMsbt.so".into())).exit_code(),
            3
        );
        let integrity = IntegrityError::Mismatch {
            tool: "clang".into(),
            expected: "version 14".into(),
            found: "clang version 15.0.0".into(),
        };
        assert_eq!(SupervisorError::from(integrity).exit_code(), 4);
    }

    #[test]
    fn pipeline_error_verdict_messages() {
        let failed = PipelineError::ToolFailed {
            phase: Phase::Compile,
            tool: "clang".into(),
            status: "exit status: 1".into(),
            stderr: String::new(),
        };
        assert_eq!(failed.verdict_message(), "compile failed");

        let spawn = PipelineError::Spawn {
            tool: "klee".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(spawn.verdict_message(), "cannot run klee");
    }

    #[test]
    fn missing_source_display() {
        let err = ConfigError::MissingSource(PathBuf::from("/no/test.c"));
        assert_eq!(err.to_string(), "input file not found: /no/test.c");
    }
}
