//! Verifier backends
//!
//! Each backend implements [`BackendAdapter`]. The set of backends is closed:
//! [`BackendKind`] names every one of them, and [`BackendRegistry`] turns a
//! name into a configured adapter.
//!
//! # Backends
//!
//! - **KLEE**: symbolic execution on LLVM bitcode, reports counterexample traces
//! - **CPAchecker**: configurable model checker working on C sources
//! - **CBMC**: bounded model checker, fed with C regenerated from the bitcode
//! - **SMACK**: bitcode to Boogie translation checked by Corral

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{OptimizePlan, RunConfiguration};
use crate::error::{ConfigError, PipelineError};
use crate::integrity::{probe_version, Fingerprint};
use crate::process::ProcessRunner;
use crate::toolchain::ResolvedEnvironment;
use crate::verdict::RunVerdict;
use crate::witness::ExecutionTrace;

pub mod cbmc;
pub mod cpachecker;
pub mod klee;
pub mod smack;

pub use cbmc::CbmcBackend;
pub use cpachecker::CpacheckerBackend;
pub use klee::KleeBackend;
pub use smack::SmackBackend;

/// Toolchain the helper tools are built against unless a backend says otherwise
pub const DEFAULT_TOOLCHAIN: &str = "llvm-14";

/// Identifier of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Klee,
    Cpachecker,
    Cbmc,
    Smack,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Klee,
        BackendKind::Cpachecker,
        BackendKind::Cbmc,
        BackendKind::Smack,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Klee => "klee",
            BackendKind::Cpachecker => "cpachecker",
            BackendKind::Cbmc => "cbmc",
            BackendKind::Smack => "smack",
        }
    }

    /// Comma separated list of every backend name
    pub fn known_names() -> String {
        Self::ALL
            .iter()
            .map(BackendKind::name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == lower)
            .ok_or_else(|| ConfigError::UnknownBackend {
                name: s.to_string(),
                known: Self::known_names(),
            })
    }
}

/// What the verification phase gets to work on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierInput {
    /// Final bitcode produced by the pipeline
    Bitcode(PathBuf),
    /// The original C sources
    Sources(Vec<PathBuf>),
}

/// Everything a backend needs while verifying
pub struct VerifyContext<'a> {
    pub runner: &'a ProcessRunner,
    pub input: &'a VerifierInput,
    pub workdir: &'a Path,
}

/// Common contract of all verifier backends
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Tag of the LLVM toolchain the backend was built with
    fn toolchain_version(&self) -> &'static str {
        DEFAULT_TOOLCHAIN
    }

    /// Main executable of the backend
    fn executable(&self) -> &'static str;

    /// Executables that must be on the resolved `PATH`
    fn required_tools(&self) -> Vec<&'static str> {
        vec![self.executable()]
    }

    /// Libraries that must be on the resolved `LD_LIBRARY_PATH`
    fn required_libraries(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Add backend specific search paths
    fn extend_environment(&self, _env: &mut ResolvedEnvironment) {}

    /// Whether the backend runs on the pipeline's bitcode rather than on sources
    fn consumes_bitcode(&self) -> bool {
        true
    }

    fn produces_correctness_witness(&self) -> bool {
        true
    }

    /// Version fingerprints checked by the integrity check
    fn fingerprints(&self) -> Vec<Fingerprint> {
        Vec::new()
    }

    /// Run the verification phase
    async fn verify(&self, ctx: &VerifyContext<'_>) -> Result<RunVerdict, PipelineError>;

    /// Human readable description of a found violation
    fn describe_violation(&self, _workdir: &Path) -> Option<String> {
        None
    }

    /// Counterexample trace of a found violation
    fn execution_trace(&self, _workdir: &Path) -> Option<ExecutionTrace> {
        None
    }

    /// First line of the backend's `--version` output
    async fn version_info(&self, env: &ResolvedEnvironment) -> Option<String> {
        probe_version(env, self.executable())
            .await
            .ok()
            .and_then(|out| out.lines().next().map(|line| line.trim().to_string()))
    }
}

/// Maps backend names to adapters
pub struct BackendRegistry;

impl BackendRegistry {
    /// Validate a backend name; performs no side effects
    pub fn lookup(name: &str) -> Result<BackendKind, ConfigError> {
        name.parse()
    }

    /// Apply backend-declared overrides and build the adapter
    pub fn instantiate(
        mut config: RunConfiguration,
    ) -> Result<(RunConfiguration, Box<dyn BackendAdapter>), ConfigError> {
        match config.backend {
            BackendKind::Cbmc => {
                if !config.explicit_symbolic {
                    info!("cbmc: enabling explicit symbolic values");
                    config.explicit_symbolic = true;
                }
            }
            BackendKind::Cpachecker => {
                if config.is_bitcode {
                    return Err(ConfigError::invalid(
                        "--bc",
                        "true",
                        "cpachecker works on C sources",
                    ));
                }
                if config.slice || config.prepare || !config.optimize.is_empty() {
                    info!("cpachecker: working on sources, disabling bitcode transformations");
                }
                config.slice = false;
                config.prepare = false;
                config.optimize = OptimizePlan::disabled();
            }
            BackendKind::Klee | BackendKind::Smack => {}
        }

        let adapter: Box<dyn BackendAdapter> = match config.backend {
            BackendKind::Klee => Box::new(KleeBackend::from_run(&config)),
            BackendKind::Cpachecker => Box::new(CpacheckerBackend::from_run(&config)),
            BackendKind::Cbmc => Box::new(CbmcBackend::from_run(&config)),
            BackendKind::Smack => Box::new(SmackBackend::from_run(&config)),
        };
        Ok((config, adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: BackendKind) -> RunConfiguration {
        RunConfiguration::new(vec![PathBuf::from("test.c")], kind)
    }

    #[test]
    fn test_lookup_known_names() {
        for kind in BackendKind::ALL {
            assert_eq!(BackendRegistry::lookup(kind.name()).unwrap(), kind);
        }
        assert_eq!(BackendRegistry::lookup("KLEE").unwrap(), BackendKind::Klee);
    }

    #[test]
    fn test_lookup_unknown_lists_known() {
        let err = BackendRegistry::lookup("ultimate").unwrap_err();
        match err {
            ConfigError::UnknownBackend { name, known } => {
                assert_eq!(name, "ultimate");
                assert_eq!(known, "klee, cpachecker, cbmc, smack");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cbmc_forces_explicit_symbolic() {
        let (config, adapter) = BackendRegistry::instantiate(config(BackendKind::Cbmc)).unwrap();
        assert!(config.explicit_symbolic);
        assert_eq!(adapter.kind(), BackendKind::Cbmc);
    }

    #[test]
    fn test_klee_keeps_configuration() {
        let original = config(BackendKind::Klee);
        let (config, adapter) = BackendRegistry::instantiate(original.clone()).unwrap();
        assert_eq!(config.explicit_symbolic, original.explicit_symbolic);
        assert_eq!(config.slice, original.slice);
        assert_eq!(adapter.name(), "klee");
    }

    #[test]
    fn test_cpachecker_disables_bitcode_phases() {
        let (config, adapter) =
            BackendRegistry::instantiate(config(BackendKind::Cpachecker)).unwrap();
        assert!(!config.slice && !config.prepare);
        assert!(config.optimize.is_empty());
        assert!(!adapter.consumes_bitcode());
    }

    #[test]
    fn test_cpachecker_rejects_bitcode_input() {
        let mut original = config(BackendKind::Cpachecker);
        original.is_bitcode = true;
        assert!(BackendRegistry::instantiate(original).is_err());
    }

    #[test]
    fn test_only_klee_needs_runtime_library() {
        for kind in BackendKind::ALL {
            let (_, adapter) = BackendRegistry::instantiate(config(kind)).unwrap();
            let needs = adapter.required_libraries().contains(&"libkleeRuntest.so");
            assert_eq!(needs, kind == BackendKind::Klee, "{kind}");
        }
    }
}
