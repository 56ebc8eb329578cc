//! Run supervisor
//!
//! Owns one verification attempt from pre-flight checks to teardown.
//! Pre-flight ([`Supervisor::prepare`]) has no side effects: it validates
//! the configuration, builds the backend adapter and resolves the toolchain.
//! [`Supervisor::run`] then creates the working directory, runs the pipeline
//! under the wall-clock timeout, applies the witness decision and always
//! tears the working directory down.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendAdapter, BackendRegistry};
use crate::config::RunConfiguration;
use crate::error::{ConfigError, DependencyError, PipelineError, SupervisorError, SupervisorResult};
use crate::integrity;
use crate::pipeline::{self, Pipeline};
use crate::process::ProcessRunner;
use crate::toolchain::{AmbientEnv, ResolvedEnvironment, ToolchainResolver};
use crate::verdict::{decide_witness, RunOutcome, RunVerdict, WitnessKind};
use crate::witness::{GraphmlWitnessWriter, WitnessRequest, WitnessWriter};
use crate::workdir::{CleanupWarning, WorkingDirectory};

/// What a finished run produced
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Path of the written witness, if any
    pub witness: Option<PathBuf>,
    pub violation_description: Option<String>,
    pub working_dir: PathBuf,
    pub preserved: bool,
    pub cleanup_warnings: Vec<CleanupWarning>,
    pub elapsed: Duration,
}

/// Compute the environment for a configuration without checking it
pub fn resolve_environment(
    config: &RunConfiguration,
    adapter: &dyn BackendAdapter,
    ambient: AmbientEnv,
) -> Result<ResolvedEnvironment, DependencyError> {
    let root = ToolchainResolver::locate_install_root(config.install_root.as_deref())?;
    let resolver = ToolchainResolver::new(root, ambient);
    let mut env = resolver.environment(adapter.toolchain_version());
    adapter.extend_environment(&mut env);
    Ok(env)
}

/// Drives one verification run
pub struct Supervisor {
    config: RunConfiguration,
    adapter: Box<dyn BackendAdapter>,
    env: ResolvedEnvironment,
    witness_writer: Box<dyn WitnessWriter>,
}

impl Supervisor {
    /// Pre-flight: validate, instantiate the backend, resolve and check the toolchain
    pub fn prepare(config: RunConfiguration, ambient: AmbientEnv) -> SupervisorResult<Self> {
        config.validate()?;
        let (config, adapter) = BackendRegistry::instantiate(config)?;
        let env = resolve_environment(&config, adapter.as_ref(), ambient)?;

        let tools = pipeline::required_tools(&config, adapter.as_ref());
        let libraries = pipeline::required_libraries(&config, adapter.as_ref());
        env.verify(&tools, &libraries)?;
        info!(
            "{} ready ({} tools, {} libraries checked)",
            adapter.name(),
            tools.len(),
            libraries.len()
        );

        Ok(Self {
            config,
            adapter,
            env,
            witness_writer: Box::new(GraphmlWitnessWriter::new()),
        })
    }

    pub fn with_witness_writer(mut self, writer: Box<dyn WitnessWriter>) -> Self {
        self.witness_writer = writer;
        self
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    pub fn adapter(&self) -> &dyn BackendAdapter {
        self.adapter.as_ref()
    }

    pub fn environment(&self) -> &ResolvedEnvironment {
        &self.env
    }

    /// Run the pipeline and tear down, whatever happens
    pub async fn run(self) -> SupervisorResult<RunReport> {
        let start = Instant::now();

        if self.config.integrity_check {
            let fingerprints = pipeline::fingerprints(&self.config, self.adapter.as_ref());
            integrity::check(&self.env, &fingerprints).await?;
        } else {
            info!("integrity check disabled");
        }

        let caller_cwd =
            std::env::current_dir().map_err(|source| SupervisorError::WorkingDirectory {
                path: PathBuf::from("."),
                source,
            })?;
        let config = absolutize(self.config.clone(), &caller_cwd)?;
        let witness_destination = config
            .witness
            .path
            .clone()
            .unwrap_or_else(|| WitnessRequest::default_destination(&config.sources, &caller_cwd));

        let prefix = match &config.working_dir_prefix {
            Some(prefix) => prefix.clone(),
            None if config.save_files => caller_cwd.clone(),
            None => std::env::temp_dir(),
        };
        let workdir = WorkingDirectory::create(&prefix, config.save_files)?;

        let cancel = CancellationToken::new();
        let deadline = start_deadline(config.timeout_secs, cancel.clone());
        let runner = ProcessRunner::new(self.env.clone(), workdir.path(), cancel.clone());

        let result = Pipeline::new(&config, self.adapter.as_ref(), &runner, workdir.path())
            .run()
            .await;
        if let Some(deadline) = deadline {
            deadline.abort();
        }

        let outcome = match result {
            Ok(verdict) => RunOutcome::Verdict(verdict),
            Err(PipelineError::Cancelled) => {
                info!("run timed out after {}s", config.timeout_secs);
                RunOutcome::Timeout
            }
            Err(e) => {
                error!("{}", e);
                if let PipelineError::ToolFailed { stderr, .. } = &e {
                    if !stderr.trim().is_empty() {
                        debug!("tool stderr:\n{}", stderr.trim_end());
                    }
                }
                RunOutcome::Verdict(RunVerdict::error(e.verdict_message()))
            }
        };

        let mut violation_description = None;
        let mut witness = None;
        if let RunOutcome::Verdict(verdict) = &outcome {
            if matches!(verdict, RunVerdict::Violation { .. }) {
                violation_description = self.adapter.describe_violation(workdir.path());
            }
            let decision = decide_witness(
                verdict,
                config.witness.enabled,
                self.adapter.produces_correctness_witness(),
            );
            if let Some(kind) = decision {
                witness = self.emit_witness(&config, kind, workdir.path(), witness_destination);
            }
        }

        let working_dir = workdir.path().to_path_buf();
        let preserved = workdir.is_preserved();
        let cleanup_warnings = workdir.teardown();
        for warning in &cleanup_warnings {
            warn!("{}", warning);
        }

        Ok(RunReport {
            outcome,
            witness,
            violation_description,
            working_dir,
            preserved,
            cleanup_warnings,
            elapsed: start.elapsed(),
        })
    }

    fn emit_witness(
        &self,
        config: &RunConfiguration,
        kind: WitnessKind,
        workdir: &Path,
        destination: PathBuf,
    ) -> Option<PathBuf> {
        let trace = match kind {
            WitnessKind::Violation => self.adapter.execution_trace(workdir),
            WitnessKind::Correctness => None,
        };
        let request = WitnessRequest {
            kind,
            property: config.property.clone(),
            sources: config.sources.clone(),
            is_32bit: config.is_32bit,
            trace,
            destination,
        };
        match self.witness_writer.write(&request) {
            Ok(()) => {
                info!("{} written to {}", kind.as_str(), request.destination.display());
                Some(request.destination)
            }
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }
}

/// Cancel `token` once `timeout_secs` have passed; no deadline for 0
fn start_deadline(timeout_secs: u64, token: CancellationToken) -> Option<JoinHandle<()>> {
    if timeout_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        info!("timeout of {}s expired, cancelling", timeout_secs);
        token.cancel();
    }))
}

/// Resolve every caller-relative path against `cwd`
fn absolutize(mut config: RunConfiguration, cwd: &Path) -> Result<RunConfiguration, ConfigError> {
    let resolve = |path: &Path| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        }
    };

    let mut sources = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let absolute = resolve(source);
        if !absolute.is_file() {
            return Err(ConfigError::MissingSource(source.clone()));
        }
        sources.push(absolute);
    }
    config.sources = sources;
    config.output = config.output.as_deref().map(resolve);
    config.witness.path = config.witness.path.as_deref().map(resolve);
    config.working_dir_prefix = config.working_dir_prefix.as_deref().map(resolve);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    #[test]
    fn absolutize_resolves_against_caller_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.c"), "").unwrap();
        let mut config = RunConfiguration::new(vec![PathBuf::from("test.c")], BackendKind::Klee);
        config.output = Some(PathBuf::from("out.bc"));
        config.witness.path = Some(PathBuf::from("/abs/w.graphml"));

        let config = absolutize(config, dir.path()).unwrap();
        assert_eq!(config.sources, vec![dir.path().join("test.c")]);
        assert_eq!(config.output, Some(dir.path().join("out.bc")));
        assert_eq!(config.witness.path, Some(PathBuf::from("/abs/w.graphml")));
    }

    #[test]
    fn absolutize_reports_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfiguration::new(vec![PathBuf::from("gone.c")], BackendKind::Klee);
        assert_eq!(
            absolutize(config, dir.path()).unwrap_err(),
            ConfigError::MissingSource(PathBuf::from("gone.c"))
        );
    }

    #[test]
    fn prepare_rejects_empty_sources() {
        let config = RunConfiguration::new(Vec::new(), BackendKind::Klee);
        let err = Supervisor::prepare(config, AmbientEnv::default())
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn prepare_reports_missing_install_root() {
        let config = RunConfiguration::new(vec![PathBuf::from("a.c")], BackendKind::Klee)
            .with_install_root("/no/such/verirun/root");
        let err = Supervisor::prepare(config, AmbientEnv::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SupervisorError::Dependency(DependencyError::MissingInstallRoot(_))
        ));
    }

    #[test]
    fn prepare_reports_first_missing_tool() {
        let root = tempfile::tempdir().unwrap();
        let config = RunConfiguration::new(vec![PathBuf::from("a.c")], BackendKind::Klee)
            .with_install_root(root.path());
        let err = Supervisor::prepare(config, AmbientEnv::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SupervisorError::Dependency(DependencyError::MissingExecutable(ref tool)) if tool == "clang"
        ));
    }

    #[tokio::test]
    async fn zero_timeout_has_no_deadline() {
        let token = CancellationToken::new();
        assert!(start_deadline(0, token.clone()).is_none());
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_token() {
        let token = CancellationToken::new();
        let handle = start_deadline(2, token.clone()).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(token.is_cancelled());
        handle.await.unwrap();
    }
}
